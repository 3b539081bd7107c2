//! The phase tracker: a stack of phase contexts and the orchestration of
//! capture, unwind and commit.
//!
//! One [`PhaseTracker`] exists per simulation thread and is passed
//! explicitly to every pipeline call. The bottom of its stack is a root
//! context running [`IdlePhase`], so there is always a current context.
//!
//! ```text
//! push_phase ──> [ pipelines capture into current() ] ──> pop_phase
//!                                                          │
//!                      unwind ─> post events ─> rollback ─> commit ─> journal
//! ```
//!
//! # Example
//!
//! ```
//! use causa_tracker::prelude::*;
//!
//! let mut tracker = PhaseTracker::new(TrackerConfig::default()).unwrap();
//! let mut world = MemoryWorld::new();
//! let mut bus = EventBus::new();
//! let pos = CellPos::new(5, 64, 10);
//!
//! let handle = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
//! tracker
//!     .capture(Proposal::new(
//!         TransactionKind::CellChange,
//!         Target::Cell(pos),
//!         State::Block(BlockState::AIR),
//!         State::Block(BlockState::WATER),
//!     ))
//!     .unwrap();
//! assert_eq!(world.block_at(pos), BlockState::AIR);
//!
//! let report = tracker.pop_phase(handle, &mut world, &mut bus).unwrap();
//! assert_eq!(report.committed, vec![0]);
//! assert_eq!(world.block_at(pos), BlockState::WATER);
//! ```

use std::thread::{self, ThreadId};

use causa_journal::journal::TransactionJournal;
use causa_world::access::WorldAccess;
use causa_world::capture::Watermark;
use causa_world::state::{ChangeFlags, State, Target};
use causa_world::transaction::{Transaction, TransactionError, TransactionKind};
use causa_world::WorldError;
use tracing::{debug, error, trace, warn};

use crate::cause_stack::CauseStack;
use crate::config::TrackerConfig;
use crate::context::{ContextBuilder, ContextId, PhaseContext};
use crate::event::EventBus;
use crate::phase::Phase;
use crate::phases::IdlePhase;
use crate::synthesis::{self, UnwindReport, Unwinding};
use crate::transactor::EffectTransactor;
use crate::TrackerError;

// ---------------------------------------------------------------------------
// PhaseHandle
// ---------------------------------------------------------------------------

/// Proof of one push. Consumed by [`PhaseTracker::pop_phase`]; not `Clone`,
/// so a context can be popped at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pushed phase must be popped with PhaseTracker::pop_phase"]
pub struct PhaseHandle {
    id: ContextId,
    depth: usize,
}

impl PhaseHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Stack depth of the context (the root is depth 0).
    pub fn depth(&self) -> usize {
        self.depth
    }
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// A mutation to capture into the current context.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    kind: TransactionKind,
    target: Target,
    original: State,
    proposed: State,
    related: Option<Target>,
    flags: ChangeFlags,
}

impl Proposal {
    pub fn new(kind: TransactionKind, target: Target, original: State, proposed: State) -> Self {
        Self {
            kind,
            target,
            original,
            proposed,
            related: None,
            flags: ChangeFlags::DEFAULT,
        }
    }

    pub fn related_to(mut self, related: Target) -> Self {
        self.related = Some(related);
        self
    }

    pub fn maybe_related_to(mut self, related: Option<Target>) -> Self {
        self.related = related;
        self
    }

    pub fn with_flags(mut self, flags: ChangeFlags) -> Self {
        self.flags = flags;
        self
    }
}

// ---------------------------------------------------------------------------
// PhaseTracker
// ---------------------------------------------------------------------------

/// The single coordinator of phase contexts for one thread.
#[derive(Debug)]
pub struct PhaseTracker {
    config: TrackerConfig,
    root: PhaseContext,
    stack: Vec<PhaseContext>,
    owner: ThreadId,
    next_context: u64,
    next_sequence: u64,
    next_transactor: u64,
    unwinds: u64,
    causes: CauseStack,
    journal: TransactionJournal,
}

impl PhaseTracker {
    /// Create a tracker owned by the calling thread.
    pub fn new(config: TrackerConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: TrackerConfig) -> Self {
        Self {
            config,
            root: PhaseContext::new(ContextId(0), &IdlePhase, ContextBuilder::new()),
            stack: Vec::new(),
            owner: thread::current().id(),
            next_context: 1,
            next_sequence: 0,
            next_transactor: 0,
            unwinds: 0,
            causes: CauseStack::new(),
            journal: TransactionJournal::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The thread allowed to drive this tracker.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    fn check_thread(&self) -> Result<(), TrackerError> {
        let caller = thread::current().id();
        if caller != self.owner {
            return Err(TrackerError::WrongThread {
                owner: self.owner,
                caller,
            });
        }
        Ok(())
    }

    // -- stack --------------------------------------------------------------

    /// Push `phase` with a context built from `builder`.
    pub fn push_phase(
        &mut self,
        phase: &'static dyn Phase,
        builder: ContextBuilder,
    ) -> Result<PhaseHandle, TrackerError> {
        self.check_thread()?;
        let top = self.current();
        if !top.phase().can_switch_to(phase) {
            return Err(TrackerError::IllegalSwitch {
                from: top.phase_name(),
                to: phase.name(),
            });
        }
        if self.stack.len() + 1 >= self.config.max_depth {
            return Err(TrackerError::DepthExceeded {
                phase: phase.name(),
                limit: self.config.max_depth,
            });
        }
        if self.config.verbose {
            let same = self
                .stack
                .iter()
                .filter(|c| c.phase_name() == phase.name())
                .count();
            if same >= self.config.runaway_threshold {
                warn!(
                    phase = phase.name(),
                    occurrences = same,
                    stack = ?self.phase_names(),
                    "runaway phase"
                );
            }
        }

        let id = ContextId(self.next_context);
        self.next_context += 1;
        self.stack.push(PhaseContext::new(id, phase, builder));
        let depth = self.stack.len();
        debug!(phase = phase.name(), context = %id, depth, "phase pushed");
        Ok(PhaseHandle { id, depth })
    }

    /// Pop the context `handle` refers to, which must be the top of the
    /// stack, and unwind it against `world` and `bus`.
    ///
    /// Listener and unwind-policy failures are logged and reported in the
    /// returned [`UnwindReport`]; the context is closed regardless. An unwind
    /// policy that returns transactions it already decided gets its whole
    /// batch discarded and an `unwind_error` in the report. An `Err` is
    /// always fatal: the stack was misused and nothing was popped.
    pub fn pop_phase(
        &mut self,
        handle: PhaseHandle,
        world: &mut dyn WorldAccess,
        bus: &mut EventBus,
    ) -> Result<UnwindReport, TrackerError> {
        self.check_thread()?;
        let top = self.current();
        if top.id() != handle.id {
            return Err(if self.stack.iter().any(|c| c.id() == handle.id) {
                TrackerError::OutOfOrderPop {
                    handle: handle.id,
                    top: top.id(),
                }
            } else {
                TrackerError::ContextClosed { id: handle.id }
            });
        }
        if top.open_transactors() > 0 {
            return Err(TrackerError::DanglingTransactor {
                context: handle.id,
                phase: top.phase_name(),
                open: top.open_transactors(),
            });
        }
        let Some(mut ctx) = self.stack.pop() else {
            return Err(TrackerError::ContextClosed { id: handle.id });
        };

        self.unwinds += 1;
        let phase = ctx.phase();
        let mut report = UnwindReport::new(phase.name(), ctx.id(), self.unwinds);
        let mut unwinding = Unwinding {
            phase: phase.name(),
            ambient: self.causes.current_chain().joined(ctx.cause()),
            serial: self.unwinds,
            journal: self.config.record_journal.then_some(&mut self.journal),
        };

        match phase.unwind(&mut ctx) {
            Ok(events) => {
                debug!(
                    phase = phase.name(),
                    context = %ctx.id(),
                    events = events.len(),
                    "unwinding"
                );
                synthesis::resolve(&mut unwinding, events, world, bus, &mut report)?;
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(
                    phase = phase.name(),
                    context = %ctx.id(),
                    cause = %unwinding.ambient,
                    error = %message,
                    "unwind failed; captured changes left unapplied"
                );
                report.unwind_error = Some(message);
            }
        }

        let leftovers = ctx.buffers_mut().drain_all();
        if !leftovers.is_empty() {
            if report.unwind_error.is_none() {
                warn!(
                    phase = phase.name(),
                    count = leftovers.len(),
                    "unprocessed captures discarded"
                );
                report.unprocessed = leftovers.iter().map(Transaction::sequence).collect();
            }
            synthesis::discard(&mut unwinding, leftovers, world, &mut report);
        }

        ctx.close();
        debug!(
            phase = phase.name(),
            context = %ctx.id(),
            depth = self.stack.len(),
            "phase popped"
        );
        Ok(report)
    }

    /// Push `phase`, run `body`, and pop, returning the body's value with
    /// the unwind report. The pop is skipped only if `body` panics.
    pub fn scope<R>(
        &mut self,
        phase: &'static dyn Phase,
        builder: ContextBuilder,
        world: &mut dyn WorldAccess,
        bus: &mut EventBus,
        body: impl FnOnce(&mut PhaseTracker, &mut dyn WorldAccess) -> R,
    ) -> Result<(R, UnwindReport), TrackerError> {
        let handle = self.push_phase(phase, builder)?;
        let value = body(self, &mut *world);
        let report = self.pop_phase(handle, world, bus)?;
        Ok((value, report))
    }

    /// The top context. Never absent: the root context is always there.
    pub fn current(&self) -> &PhaseContext {
        self.stack.last().unwrap_or(&self.root)
    }

    pub(crate) fn current_mut(&mut self) -> &mut PhaseContext {
        match self.stack.last_mut() {
            Some(ctx) => ctx,
            None => &mut self.root,
        }
    }

    /// Number of pushed contexts (the root is not counted).
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Phase names from the root up.
    pub fn phase_names(&self) -> Vec<&'static str> {
        std::iter::once(&self.root)
            .chain(self.stack.iter())
            .map(PhaseContext::phase_name)
            .collect()
    }

    /// How many contexts have been popped so far.
    pub fn unwind_count(&self) -> u64 {
        self.unwinds
    }

    fn context_mut(&mut self, id: ContextId) -> Option<&mut PhaseContext> {
        if self.root.id() == id {
            return Some(&mut self.root);
        }
        self.stack.iter_mut().find(|c| c.id() == id)
    }

    // -- capture ------------------------------------------------------------

    /// Whether the current phase captures `kind`.
    pub fn captures(&self, kind: TransactionKind) -> bool {
        self.current().phase().captures(kind)
    }

    /// Record `proposal` in the current context and return its sequence
    /// number. Fails with [`TrackerError::NotCapturing`] if the current
    /// phase does not capture that kind.
    pub fn capture(&mut self, proposal: Proposal) -> Result<u64, TrackerError> {
        self.check_thread()?;
        let Proposal {
            kind,
            target,
            original,
            proposed,
            related,
            flags,
        } = proposal;
        let phase = self.current().phase();
        if !phase.captures(kind) {
            return Err(TrackerError::NotCapturing {
                phase: phase.name(),
                kind,
            });
        }
        for state in [&original, &proposed] {
            if !state.fits(&target) {
                return Err(TransactionError::StateMismatch {
                    target,
                    state: state.clone(),
                }
                .into());
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut tx = Transaction::new(kind, target, original, proposed, sequence).with_flags(flags);
        if let Some(related) = related {
            tx = tx.related_to(related);
        }
        let enclosing = &self.stack[..self.stack.len().saturating_sub(1)];
        if enclosing
            .iter()
            .any(|ctx| ctx.buffers().latest_proposed(&target).is_some())
        {
            tx = tx.from_pending();
        }
        trace!(phase = phase.name(), sequence, kind = %kind, target = %target, "captured");
        self.current_mut().buffers_mut().push(tx);
        Ok(sequence)
    }

    /// Replace the proposed state of a transaction still open in the
    /// current context (not yet sealed by its pipeline run).
    pub fn amend_proposed(&mut self, sequence: u64, state: State) -> Result<(), TrackerError> {
        self.check_thread()?;
        let tx = self
            .current_mut()
            .buffers_mut()
            .find_mut(sequence)
            .ok_or(TrackerError::UnknownTransaction { sequence })?;
        tx.replace_proposed(state)?;
        Ok(())
    }

    /// The latest proposed state for `target` captured anywhere on the
    /// stack, innermost context first.
    pub fn pending_state(&self, target: &Target) -> Option<&State> {
        self.stack
            .iter()
            .rev()
            .find_map(|ctx| ctx.buffers().latest_proposed(target))
    }

    /// The state of `target` as the running simulation sees it: pending
    /// captures first, then the world.
    pub fn read_state(&self, world: &dyn WorldAccess, target: &Target) -> Result<State, WorldError> {
        match self.pending_state(target) {
            Some(state) => Ok(state.clone()),
            None => world.read_state(target),
        }
    }

    // -- transactors --------------------------------------------------------

    /// Open an effect scope for `step` on the current context.
    pub fn open_transactor(&mut self, step: &str) -> Result<EffectTransactor<'_>, TrackerError> {
        self.check_thread()?;
        let id = self.next_transactor;
        self.next_transactor += 1;
        let ctx = self.current_mut();
        let context = ctx.id();
        let mark = ctx.open_transactor(id, step)?;
        trace!(step, context = %context, transactor = id, "transactor opened");
        Ok(EffectTransactor::new(self, context, id, mark))
    }

    pub(crate) fn close_transactor(&mut self, context: ContextId, id: u64) -> Result<(), TrackerError> {
        self.context_mut(context)
            .ok_or(TrackerError::ContextClosed { id: context })?
            .close_transactor(id)
    }

    pub(crate) fn truncate_context(&mut self, context: ContextId, mark: Watermark) -> Vec<Transaction> {
        self.context_mut(context)
            .map(|ctx| ctx.buffers_mut().truncate_to(mark))
            .unwrap_or_default()
    }

    /// Seal everything `context` captured since `mark`.
    pub(crate) fn seal_since(&mut self, context: ContextId, mark: Watermark) {
        if let Some(ctx) = self.context_mut(context) {
            ctx.buffers_mut().seal_since(mark);
        }
    }

    // -- collaborators ------------------------------------------------------

    pub fn cause_stack(&self) -> &CauseStack {
        &self.causes
    }

    /// Mutable access to the cause stack. Owner thread only.
    pub fn cause_stack_mut(&mut self) -> Result<&mut CauseStack, TrackerError> {
        self.check_thread()?;
        Ok(&mut self.causes)
    }

    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    /// Mutable access to the journal. Owner thread only.
    pub fn journal_mut(&mut self) -> Result<&mut TransactionJournal, TrackerError> {
        self.check_thread()?;
        Ok(&mut self.journal)
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::with_valid_config(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::{BlockTickPhase, ExplosionPhase, PacketPhase, PluginPhase};
    use causa_world::memory::MemoryWorld;
    use causa_world::state::{BlockState, CellPos};

    fn place(pos: CellPos, to: BlockState) -> Proposal {
        Proposal::new(
            TransactionKind::CellChange,
            Target::Cell(pos),
            State::Block(BlockState::AIR),
            State::Block(to),
        )
    }

    #[test]
    fn root_context_is_idle() {
        let tracker = PhaseTracker::default();
        assert_eq!(tracker.depth(), 0);
        assert_eq!(tracker.current().phase_name(), IdlePhase::NAME);
        assert_eq!(tracker.phase_names(), vec!["idle"]);
    }

    #[test]
    fn idle_refuses_capture() {
        let mut tracker = PhaseTracker::default();
        let err = tracker
            .capture(place(CellPos::new(0, 0, 0), BlockState::STONE))
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotCapturing { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn handles_report_depth() {
        let mut tracker = PhaseTracker::default();
        let outer = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        let inner = tracker.push_phase(&ExplosionPhase, ContextBuilder::new()).unwrap();
        assert_eq!(outer.depth(), 1);
        assert_eq!(inner.depth(), 2);
        assert_eq!(tracker.phase_names(), vec!["idle", "block-tick", "explosion"]);

        let mut world = MemoryWorld::new();
        let mut bus = EventBus::new();
        tracker.pop_phase(inner, &mut world, &mut bus).unwrap();
        tracker.pop_phase(outer, &mut world, &mut bus).unwrap();
        assert_eq!(tracker.unwind_count(), 2);
    }

    #[test]
    fn illegal_switch_is_recoverable() {
        let mut tracker = PhaseTracker::default();
        let packet = tracker.push_phase(&PacketPhase, ContextBuilder::new()).unwrap();
        let err = tracker
            .push_phase(&PluginPhase, ContextBuilder::new())
            .unwrap_err();
        assert_eq!(
            err,
            TrackerError::IllegalSwitch {
                from: "packet-handling",
                to: "plugin-change",
            }
        );
        assert!(!err.is_fatal());
        assert_eq!(tracker.depth(), 1);
        tracker
            .pop_phase(packet, &mut MemoryWorld::new(), &mut EventBus::new())
            .unwrap();
    }

    #[test]
    fn depth_limit_counts_root() {
        let config = TrackerConfig {
            max_depth: 2,
            ..Default::default()
        };
        let mut tracker = PhaseTracker::new(config).unwrap();
        let _first = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        let err = tracker
            .push_phase(&BlockTickPhase, ContextBuilder::new())
            .unwrap_err();
        assert!(matches!(err, TrackerError::DepthExceeded { limit: 2, .. }));
    }

    #[test]
    fn pending_state_sees_inner_captures_first() {
        let mut tracker = PhaseTracker::default();
        let pos = CellPos::new(1, 64, 1);
        let target = Target::Cell(pos);
        let _outer = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        tracker.capture(place(pos, BlockState::STONE)).unwrap();
        let _inner = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        assert_eq!(
            tracker.pending_state(&target),
            Some(&State::Block(BlockState::STONE))
        );
        tracker.capture(place(pos, BlockState::WATER)).unwrap();
        assert_eq!(
            tracker.pending_state(&target),
            Some(&State::Block(BlockState::WATER))
        );

        let world = MemoryWorld::new();
        assert_eq!(
            tracker.read_state(&world, &target).unwrap(),
            State::Block(BlockState::WATER)
        );
        assert_eq!(
            tracker
                .read_state(&world, &Target::Cell(CellPos::new(9, 9, 9)))
                .unwrap(),
            State::Block(BlockState::AIR)
        );
    }

    #[test]
    fn amend_until_sealed() {
        let mut tracker = PhaseTracker::default();
        let _h = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        let seq = tracker
            .capture(place(CellPos::new(0, 64, 0), BlockState::STONE))
            .unwrap();
        tracker
            .amend_proposed(seq, State::Block(BlockState::WATER))
            .unwrap();
        let ctx = tracker.current().id();
        tracker.seal_since(ctx, Watermark::default());
        let err = tracker
            .amend_proposed(seq, State::Block(BlockState::STONE))
            .unwrap_err();
        assert_eq!(err, TrackerError::Transaction(TransactionError::Sealed { sequence: seq }));
        assert!(matches!(
            tracker.amend_proposed(99, State::Block(BlockState::STONE)),
            Err(TrackerError::UnknownTransaction { sequence: 99 })
        ));
    }

    #[test]
    fn mismatched_proposal_is_rejected() {
        let mut tracker = PhaseTracker::default();
        let _h = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        let err = tracker
            .capture(Proposal::new(
                TransactionKind::CellChange,
                Target::Cell(CellPos::new(0, 0, 0)),
                State::Block(BlockState::AIR),
                State::Item(None),
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Transaction(TransactionError::StateMismatch { .. })
        ));
        assert!(tracker.current().buffers().is_empty());
    }

    #[test]
    fn journal_can_be_disabled() {
        let config = TrackerConfig {
            record_journal: false,
            ..Default::default()
        };
        let mut tracker = PhaseTracker::new(config).unwrap();
        let mut world = MemoryWorld::new();
        let mut bus = EventBus::new();
        let (_, report) = tracker
            .scope(&BlockTickPhase, ContextBuilder::new(), &mut world, &mut bus, |t, _| {
                t.capture(place(CellPos::new(0, 64, 0), BlockState::STONE)).unwrap();
            })
            .unwrap();
        assert_eq!(report.committed, vec![0]);
        assert!(tracker.journal().is_empty());
    }
}
