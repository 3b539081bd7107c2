//! Stack discipline, isolation, ordering and scoping guarantees of the
//! tracker, checked one at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use causa_tracker::prelude::*;

fn cell(x: i32) -> CellPos {
    CellPos::new(x, 64, 0)
}

fn place(x: i32) -> Proposal {
    Proposal::new(
        TransactionKind::CellChange,
        Target::Cell(cell(x)),
        State::Block(BlockState::AIR),
        State::Block(BlockState::STONE),
    )
}

fn cancel_everything(bus: &mut EventBus) {
    bus.subscribe("cancel-all", Order::Default, EventFilter::All, |event| {
        event.set_cancelled(true);
        Ok(())
    });
}

// -- LIFO discipline ---------------------------------------------------------

#[test]
fn popping_below_the_top_is_fatal_and_changes_nothing() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let outer = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    let inner = tracker.push_phase(&EntityTickPhase, ContextBuilder::new()).unwrap();
    let outer_id = outer.id();
    let inner_id = inner.id();

    let err = tracker.pop_phase(outer, &mut world, &mut bus).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        err,
        TrackerError::OutOfOrderPop {
            handle: outer_id,
            top: inner_id,
        }
    );
    assert_eq!(tracker.depth(), 2);
    assert_eq!(tracker.current().id(), inner_id);
    tracker.pop_phase(inner, &mut world, &mut bus).unwrap();
}

#[test]
fn popping_with_open_transactor_is_fatal() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let handle = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    let id = handle.id();

    let mut transactor = tracker.open_transactor("long-running").unwrap();
    let err = transactor.pop_phase(handle, &mut world, &mut bus).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        TrackerError::DanglingTransactor { context, open: 1, .. } if context == id
    ));
    drop(transactor);
    assert_eq!(tracker.depth(), 1);
}

#[test]
fn tracker_is_bound_to_its_thread() {
    let tracker = PhaseTracker::default();
    let owner = tracker.owner();
    let err = std::thread::spawn(move || {
        let mut tracker = tracker;
        tracker
            .push_phase(&BlockTickPhase, ContextBuilder::new())
            .unwrap_err()
    })
    .join()
    .unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err, TrackerError::WrongThread { owner: o, .. } if o == owner));
}

#[test]
fn collaborators_are_bound_to_the_owner_thread() {
    let tracker = PhaseTracker::default();
    let owner = tracker.owner();
    let (causes, journal) = std::thread::spawn(move || {
        let mut tracker = tracker;
        let causes = tracker.cause_stack_mut().map(|_| ()).unwrap_err();
        let journal = tracker.journal_mut().map(|_| ()).unwrap_err();
        (causes, journal)
    })
    .join()
    .unwrap();
    for err in [causes, journal] {
        assert!(matches!(err, TrackerError::WrongThread { owner: o, .. } if o == owner));
    }
}

// -- Capture isolation -------------------------------------------------------

#[test]
fn captures_land_only_in_the_top_context() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let outer = tracker.push_phase(&PacketPhase, ContextBuilder::new()).unwrap();
    let a = tracker.capture(place(0)).unwrap();
    let inner = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    let b = tracker.capture(place(1)).unwrap();
    let c = tracker.capture(place(2)).unwrap();

    let inner_seqs: Vec<u64> = tracker
        .current()
        .buffers()
        .since(Watermark::default())
        .iter()
        .map(|tx| tx.sequence())
        .collect();
    assert_eq!(inner_seqs, vec![b, c]);

    let report = tracker.pop_phase(inner, &mut world, &mut bus).unwrap();
    assert_eq!(report.committed, vec![b, c]);
    let outer_seqs: Vec<u64> = tracker
        .current()
        .buffers()
        .since(Watermark::default())
        .iter()
        .map(|tx| tx.sequence())
        .collect();
    assert_eq!(outer_seqs, vec![a]);
    tracker.pop_phase(outer, &mut world, &mut bus).unwrap();
}

// -- Rollback order ----------------------------------------------------------

#[test]
fn rollback_restores_in_reverse_capture_order() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    cancel_everything(&mut bus);

    let handle = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    // Captured as A, B, C but posted in different events.
    tracker.capture(place(0)).unwrap();
    tracker
        .capture(Proposal::new(
            TransactionKind::CellChange,
            Target::Cell(cell(1)),
            State::Block(BlockState::STONE),
            State::Block(BlockState::AIR),
        ))
        .unwrap();
    tracker.capture(place(2)).unwrap();
    let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();

    assert_eq!(report.rolled_back, vec![2, 1, 0]);
    let restored: Vec<Target> = world.writes().iter().map(|w| w.target).collect();
    assert_eq!(
        restored,
        vec![Target::Cell(cell(2)), Target::Cell(cell(1)), Target::Cell(cell(0))]
    );
    assert!(world.writes().iter().all(|w| w.flags == ChangeFlags::RESTORE));
}

#[test]
fn missing_rollback_target_is_skipped() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    cancel_everything(&mut bus);
    let far = CellPos::new(100, 64, 100);

    let handle = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    tracker.capture(place(0)).unwrap();
    tracker
        .capture(Proposal::new(
            TransactionKind::CellChange,
            Target::Cell(far),
            State::Block(BlockState::AIR),
            State::Block(BlockState::STONE),
        ))
        .unwrap();
    world.unload_chunk(far);
    let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();

    assert_eq!(report.missed_rollbacks, vec![1]);
    assert_eq!(report.rolled_back, vec![0]);
    assert_eq!(
        tracker
            .journal()
            .entries_with_outcome(Outcome::RollbackMissed)
            .count(),
        1
    );
}

// -- Commit exactly once -----------------------------------------------------

#[test]
fn each_transaction_is_written_once() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    bus.subscribe("odd-out", Order::Default, EventFilter::All, |event| {
        let odd: Vec<u64> = event
            .transactions()
            .iter()
            .map(|tx| tx.sequence())
            .filter(|seq| seq % 2 == 1)
            .collect();
        for seq in odd {
            event.invalidate(seq);
        }
        Ok(())
    });

    let handle = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    for x in 0..6 {
        tracker.capture(place(x)).unwrap();
    }
    let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();

    assert_eq!(report.committed, vec![0, 2, 4]);
    assert_eq!(report.rolled_back, vec![5, 3, 1]);
    assert_eq!(world.writes().len(), 6);
    for x in [1, 3, 5] {
        assert!(world
            .writes()
            .iter()
            .filter(|w| w.target == Target::Cell(cell(x)))
            .all(|w| w.state == State::Block(BlockState::AIR)));
    }
}

// -- Pipeline short-circuit --------------------------------------------------

#[test]
fn pipeline_stops_at_first_result() {
    let calls: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let (c1, c2, c3) = (Arc::clone(&calls[0]), Arc::clone(&calls[1]), Arc::clone(&calls[2]));
    let pipeline: Pipeline<()> = Pipeline::builder("short-circuit")
        .step_fn("s1", move |_, _, _| {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(EffectResult::Pass)
        })
        .step_fn("s2", move |_, _, _| {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(EffectResult::Done(State::Block(BlockState::STONE)))
        })
        .step_fn("s3", move |_, _, _| {
            c3.fetch_add(1, Ordering::SeqCst);
            Ok(EffectResult::Pass)
        })
        .build();

    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    for _ in 0..2 {
        let out = pipeline
            .process(
                &mut tracker,
                &mut world,
                Target::Cell(cell(0)),
                State::Block(BlockState::AIR),
                &(),
                State::Block(BlockState::AIR),
            )
            .unwrap();
        assert_eq!(out, State::Block(BlockState::STONE));
    }
    let counts: Vec<usize> = calls.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(counts, vec![2, 2, 0]);
}

// -- Transactor balance ------------------------------------------------------

#[test]
fn transactors_close_when_steps_fail_or_panic() {
    let failing: Pipeline<()> = Pipeline::builder("failing")
        .step_fn("ok", |_, _, _| Ok(EffectResult::Pass))
        .step_fn("err", |_, _, _| Err(EffectError::Rejected("no".into())))
        .build();
    let panicking: Pipeline<()> = Pipeline::builder("panicking")
        .step_fn("boom", |_, _, _| panic!("step exploded"))
        .build();

    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let _handle = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();

    let run = |pipeline: &Pipeline<()>, tracker: &mut PhaseTracker, world: &mut MemoryWorld| {
        pipeline.process(
            tracker,
            world,
            Target::Cell(cell(0)),
            State::Block(BlockState::AIR),
            &(),
            State::Block(BlockState::AIR),
        )
    };

    assert!(run(&failing, &mut tracker, &mut world).is_err());
    assert_eq!(tracker.current().open_transactors(), 0);
    assert_eq!(tracker.current().step_log().len(), 2);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = run(&panicking, &mut tracker, &mut world);
    }));
    assert!(outcome.is_err());
    assert_eq!(tracker.current().open_transactors(), 0);
    assert_eq!(tracker.current().step_log().len(), 3);
}

#[test]
#[should_panic(expected = "closed out of order")]
fn outer_transactor_dropped_first_panics() {
    let mut tracker = PhaseTracker::default();
    let _handle = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    let mut outer = tracker.open_transactor("outer").unwrap();
    let inner = outer.open_transactor("inner").unwrap();
    // Leak the inner scope so the outer one closes while it is still open.
    std::mem::forget(inner);
    drop(outer);
}

#[test]
fn cause_stack_feeds_event_causes() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let player = world.insert_entity(EntitySnapshot::new("player", cell(0)));

    let frame = tracker.cause_stack_mut().unwrap().push_frame();
    tracker.cause_stack_mut().unwrap().push_cause(Cause::Player(player));
    let (_, report) = tracker
        .scope(
            &PluginPhase,
            ContextBuilder::new().cause(Cause::Plugin("worldedit".into())),
            &mut world,
            &mut bus,
            |tracker, _| {
                tracker.capture(place(3)).unwrap();
            },
        )
        .unwrap();
    tracker.cause_stack_mut().unwrap().pop_frame(frame).unwrap();

    assert_eq!(report.committed.len(), 1);
    let entry = tracker.journal().entries().next().unwrap();
    let causes: Vec<&Cause> = entry.cause.iter().collect();
    assert_eq!(
        causes,
        vec![&Cause::Player(player), &Cause::Plugin("worldedit".into())]
    );
}

#[test]
fn failing_unwind_policy_leaves_world_untouched() {
    #[derive(Debug)]
    struct BrokenPhase;

    impl Phase for BrokenPhase {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn unwind(&self, _ctx: &mut PhaseContext) -> anyhow::Result<Vec<DomainEvent>> {
            anyhow::bail!("policy bug")
        }
    }

    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let handle = tracker.push_phase(&BrokenPhase, ContextBuilder::new()).unwrap();
    tracker.capture(place(0)).unwrap();
    let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();

    assert_eq!(report.unwind_error.as_deref(), Some("policy bug"));
    assert_eq!(report.discarded, vec![0]);
    assert!(report.unprocessed.is_empty());
    assert!(world.writes().is_empty());
    assert_eq!(tracker.depth(), 0);
}

#[test]
fn leftover_captures_are_discarded() {
    #[derive(Debug)]
    struct CellsOnly;

    impl Phase for CellsOnly {
        fn name(&self) -> &'static str {
            "cells-only"
        }

        fn unwind(&self, ctx: &mut PhaseContext) -> anyhow::Result<Vec<DomainEvent>> {
            let cells = ctx.buffers_mut().drain(TransactionKind::CellChange);
            Ok(vec![DomainEvent::new(EventType::ModifyBlock, cells)])
        }
    }

    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let handle = tracker.push_phase(&CellsOnly, ContextBuilder::new()).unwrap();
    tracker.capture(place(0)).unwrap();
    let slot_holder = world.insert_entity(EntitySnapshot::new("player", cell(0)));
    tracker
        .capture(Proposal::new(
            TransactionKind::InteractionResult,
            Target::Slot {
                holder: slot_holder,
                slot: 0,
            },
            State::Item(None),
            State::Item(Some(ItemStack::new("torch", 1))),
        ))
        .unwrap();
    let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();

    assert_eq!(report.committed, vec![0]);
    assert_eq!(report.unprocessed, vec![1]);
    assert_eq!(report.discarded, vec![1]);
    assert!(world.slot(slot_holder, 0).is_none());
}

#[test]
fn unwind_returning_decided_transactions_is_discarded() {
    #[derive(Debug)]
    struct Prejudging;

    impl Phase for Prejudging {
        fn name(&self) -> &'static str {
            "prejudging"
        }

        fn unwind(&self, ctx: &mut PhaseContext) -> anyhow::Result<Vec<DomainEvent>> {
            let mut cells = ctx.buffers_mut().drain(TransactionKind::CellChange);
            cells[0].transition(TransactionStatus::Valid)?;
            Ok(vec![DomainEvent::new(EventType::PlaceBlock, cells)])
        }
    }

    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let handle = tracker.push_phase(&Prejudging, ContextBuilder::new()).unwrap();
    tracker.capture(place(0)).unwrap();
    tracker.capture(place(1)).unwrap();
    let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();

    assert!(report.unwind_error.is_some());
    assert_eq!(report.discarded, vec![0, 1]);
    assert!(report.committed.is_empty());
    assert!(world.writes().is_empty());
    assert_eq!(tracker.depth(), 0);
    assert_eq!(
        tracker.journal().entries_with_outcome(Outcome::Discarded).count(),
        2
    );
}

#[test]
fn restoring_over_a_failed_outer_phase_leaves_the_world_alone() {
    #[derive(Debug)]
    struct BrokenPhase;

    impl Phase for BrokenPhase {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn unwind(&self, _ctx: &mut PhaseContext) -> anyhow::Result<Vec<DomainEvent>> {
            anyhow::bail!("policy bug")
        }
    }

    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    let pipelines = StandardPipelines::new(|_: &BlockState| Vec::new());
    let pos = CellPos::new(1, 64, 1);
    bus.subscribe("veto-modify", Order::Default, EventFilter::only([EventType::ModifyBlock]), |event| {
        event.set_cancelled(true);
        Ok(())
    });

    let outer = tracker.push_phase(&BrokenPhase, ContextBuilder::new()).unwrap();
    pipelines
        .set_block(&mut tracker, &mut world, pos, BlockState::STONE)
        .unwrap();
    let inner = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
    pipelines
        .set_block(&mut tracker, &mut world, pos, BlockState::WATER)
        .unwrap();

    let report = tracker.pop_phase(inner, &mut world, &mut bus).unwrap();
    assert_eq!(report.rolled_back, vec![1]);
    assert!(world.writes().iter().all(|w| w.target != Target::Cell(pos)));

    let report = tracker.pop_phase(outer, &mut world, &mut bus).unwrap();
    assert_eq!(report.discarded, vec![0]);
    assert_eq!(world.block_at(pos), BlockState::AIR);
    assert!(world.writes().is_empty());
}

#[test]
fn idle_root_keeps_no_step_history() {
    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let pipelines = StandardPipelines::new(|_: &BlockState| Vec::new());
    for x in 0..1000 {
        pipelines
            .set_block(&mut tracker, &mut world, cell(x), BlockState::STONE)
            .unwrap();
    }
    assert_eq!(world.writes().len(), 1000);
    assert!(tracker.current().step_log().is_empty());
    assert_eq!(tracker.current().open_transactors(), 0);
}
