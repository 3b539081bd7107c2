use std::collections::BTreeSet;

use causa_tracker::prelude::*;
use proptest::prelude::*;

/// One captured cell change, and whether a listener rejects it.
#[derive(Debug, Clone)]
struct Step {
    x: i32,
    place: bool,
    reject: bool,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    (0..8i32, any::<bool>(), any::<bool>()).prop_map(|(x, place, reject)| Step { x, place, reject })
}

fn proposal(step: &Step) -> Proposal {
    let (from, to) = if step.place {
        (BlockState::AIR, BlockState::STONE)
    } else {
        (BlockState::STONE, BlockState::AIR)
    };
    Proposal::new(
        TransactionKind::CellChange,
        Target::Cell(CellPos::new(step.x, 64, 0)),
        State::Block(from),
        State::Block(to),
    )
}

fn run(steps: &[Step], cancel_post: bool) -> (UnwindReport, MemoryWorld) {
    let rejected: BTreeSet<u64> = steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.reject)
        .map(|(i, _)| i as u64)
        .collect();

    let mut tracker = PhaseTracker::default();
    let mut world = MemoryWorld::new();
    let mut bus = EventBus::new();
    bus.subscribe("reject", Order::Default, EventFilter::All, move |event| {
        if event.event_type() == EventType::Post {
            if cancel_post {
                event.set_cancelled(true);
            }
            return Ok(());
        }
        let members: Vec<u64> = event.transactions().iter().map(|tx| tx.sequence()).collect();
        for seq in members.into_iter().filter(|s| rejected.contains(s)) {
            event.invalidate(seq);
        }
        Ok(())
    });

    let handle = tracker
        .push_phase(&BlockTickPhase, ContextBuilder::new())
        .unwrap();
    for step in steps {
        tracker.capture(proposal(step)).unwrap();
    }
    let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();
    (report, world)
}

proptest! {
    #[test]
    fn every_capture_is_decided_once(
        steps in prop::collection::vec(step_strategy(), 0..24),
        cancel_post in any::<bool>(),
    ) {
        let (report, world) = run(&steps, cancel_post);

        let committed: BTreeSet<u64> = report.committed.iter().copied().collect();
        let rolled_back: BTreeSet<u64> = report.rolled_back.iter().copied().collect();
        prop_assert_eq!(committed.len(), report.committed.len());
        prop_assert_eq!(rolled_back.len(), report.rolled_back.len());
        prop_assert!(committed.is_disjoint(&rolled_back));
        prop_assert_eq!(committed.len() + rolled_back.len(), steps.len());
        prop_assert_eq!(world.writes().len(), steps.len());

        for seq in &committed {
            prop_assert!(!cancel_post);
            prop_assert!(!steps[*seq as usize].reject);
        }
    }

    #[test]
    fn rollbacks_run_newest_first_and_commits_oldest_first(
        steps in prop::collection::vec(step_strategy(), 1..24),
        cancel_post in any::<bool>(),
    ) {
        let (report, world) = run(&steps, cancel_post);

        prop_assert!(report.rolled_back.windows(2).all(|w| w[0] > w[1]));
        prop_assert!(report.committed.windows(2).all(|w| w[0] < w[1]));

        // All restores are written before any commit.
        let first_commit = world
            .writes()
            .iter()
            .position(|w| w.flags != ChangeFlags::RESTORE)
            .unwrap_or(world.writes().len());
        prop_assert_eq!(first_commit, report.rolled_back.len());
    }

    #[test]
    fn nested_phases_pop_cleanly_in_lifo_order(depth in 1usize..16) {
        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let mut bus = EventBus::new();

        let mut handles = Vec::new();
        for i in 0..depth {
            handles.push(tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap());
            tracker.capture(proposal(&Step { x: i as i32, place: true, reject: false })).unwrap();
        }
        prop_assert_eq!(tracker.depth(), depth);

        let mut expected = depth as u64;
        while let Some(handle) = handles.pop() {
            expected -= 1;
            let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();
            prop_assert_eq!(report.committed, vec![expected]);
        }
        prop_assert_eq!(tracker.depth(), 0);
        prop_assert_eq!(tracker.unwind_count(), depth as u64);
    }
}
