//! Phase contexts: the mutable record of one pushed phase.
//!
//! A [`PhaseContext`] owns the capture buffers that collect every mutation
//! made while it is on top of the stack, the cause chain its events will
//! carry, and the bookkeeping for the effect transactors currently open on
//! it. Contexts are created by [`PhaseTracker::push_phase`] from a
//! [`ContextBuilder`] and destroyed after unwind.
//!
//! [`PhaseTracker::push_phase`]: crate::tracker::PhaseTracker::push_phase

use std::fmt;

use causa_world::capture::{CaptureBuffers, Watermark};
use causa_world::cause::{Cause, CauseChain};
use causa_world::entity::EntityId;
use causa_world::state::CellPos;
use causa_world::transaction::TransactionKind;

use crate::phase::Phase;
use crate::TrackerError;

// ---------------------------------------------------------------------------
// ContextId
// ---------------------------------------------------------------------------

/// Identity of one context, unique per tracker. The root context is `ctx#0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub(crate) u64);

impl ContextId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

/// Initial cause metadata for a context about to be pushed.
///
/// ```
/// use causa_tracker::prelude::*;
///
/// let builder = ContextBuilder::new()
///     .cause(Cause::Tick(12))
///     .notifier(CellPos::new(5, 64, 10));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    cause: CauseChain,
    notifier: Option<CellPos>,
    owner: Option<EntityId>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cause (root first).
    pub fn cause(mut self, cause: Cause) -> Self {
        self.cause.push(cause);
        self
    }

    /// The cell whose update triggered this scope.
    pub fn notifier(mut self, pos: CellPos) -> Self {
        self.notifier = Some(pos);
        self
    }

    /// The entity on whose behalf the scope runs.
    pub fn owner(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }
}

// ---------------------------------------------------------------------------
// Transactor bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OpenTransactor {
    id: u64,
    step: String,
    mark: Watermark,
}

/// One closed effect transactor: which step ran, how deeply it was nested,
/// and which transactions were captured while it was open (nested steps
/// included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    pub depth: usize,
    pub captured: Vec<u64>,
}

// ---------------------------------------------------------------------------
// PhaseContext
// ---------------------------------------------------------------------------

/// The per-invocation record of one active phase.
#[derive(Debug)]
pub struct PhaseContext {
    id: ContextId,
    phase: &'static dyn Phase,
    buffers: CaptureBuffers,
    cause: CauseChain,
    notifier: Option<CellPos>,
    owner: Option<EntityId>,
    open: Vec<OpenTransactor>,
    steps: Vec<StepRecord>,
    closed: bool,
}

impl PhaseContext {
    pub(crate) fn new(id: ContextId, phase: &'static dyn Phase, builder: ContextBuilder) -> Self {
        let ContextBuilder {
            mut cause,
            notifier,
            owner,
        } = builder;
        if let Some(pos) = notifier {
            cause.push(Cause::Notifier(pos));
        }
        if let Some(owner) = owner {
            cause.push(Cause::Owner(owner));
        }
        Self {
            id,
            phase,
            buffers: CaptureBuffers::new(),
            cause,
            notifier,
            owner,
            open: Vec::new(),
            steps: Vec::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn phase(&self) -> &'static dyn Phase {
        self.phase
    }

    pub fn phase_name(&self) -> &'static str {
        self.phase.name()
    }

    pub fn buffers(&self) -> &CaptureBuffers {
        &self.buffers
    }

    /// Mutable buffers, for unwind policies that drain them.
    pub fn buffers_mut(&mut self) -> &mut CaptureBuffers {
        &mut self.buffers
    }

    /// Causes attached when the context was built, notifier and owner last.
    pub fn cause(&self) -> &CauseChain {
        &self.cause
    }

    pub fn notifier(&self) -> Option<CellPos> {
        self.notifier
    }

    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of effect transactors currently open on this context.
    pub fn open_transactors(&self) -> usize {
        self.open.len()
    }

    /// Names of the open transactors' steps, outermost first.
    pub fn open_steps(&self) -> Vec<&str> {
        self.open.iter().map(|t| t.step.as_str()).collect()
    }

    /// Every transactor closed on this context, in closing order. Stays
    /// empty for phases that capture nothing.
    pub fn step_log(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Sequences attributed to the named step across all of its runs.
    pub fn captured_by_step(&self, step: &str) -> Vec<u64> {
        let mut out: Vec<u64> = self
            .steps
            .iter()
            .filter(|r| r.step == step)
            .flat_map(|r| r.captured.iter().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    // -- transactor protocol (driven by the tracker) ------------------------

    pub(crate) fn open_transactor(&mut self, id: u64, step: &str) -> Result<Watermark, TrackerError> {
        if self.closed {
            return Err(TrackerError::ContextClosed { id: self.id });
        }
        let mark = self.buffers.watermark();
        self.open.push(OpenTransactor {
            id,
            step: step.to_owned(),
            mark,
        });
        Ok(mark)
    }

    /// Close transactor `id`, which must be the innermost open one.
    pub(crate) fn close_transactor(&mut self, id: u64) -> Result<(), TrackerError> {
        match self.open.last() {
            Some(top) if top.id == id => {}
            _ => {
                return Err(TrackerError::TransactorOutOfOrder {
                    context: self.id,
                    transactor: id,
                    innermost: self.open.last().map(|t| t.id),
                })
            }
        }
        let Some(done) = self.open.pop() else {
            return Ok(());
        };
        // Contexts that capture nothing keep no step log.
        if !TransactionKind::ALL.iter().any(|&k| self.phase.captures(k)) {
            return Ok(());
        }
        let captured = self
            .buffers
            .since(done.mark)
            .into_iter()
            .map(|tx| tx.sequence())
            .collect();
        self.steps.push(StepRecord {
            step: done.step,
            depth: self.open.len(),
            captured,
        });
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::BlockTickPhase;
    use causa_world::state::{BlockState, State, Target};
    use causa_world::transaction::{Transaction, TransactionKind};

    fn ctx() -> PhaseContext {
        PhaseContext::new(ContextId(1), &BlockTickPhase, ContextBuilder::new())
    }

    fn cell_tx(seq: u64) -> Transaction {
        Transaction::new(
            TransactionKind::CellChange,
            Target::Cell(CellPos::new(seq as i32, 0, 0)),
            State::Block(BlockState::AIR),
            State::Block(BlockState::STONE),
            seq,
        )
    }

    #[test]
    fn builder_causes_keep_order() {
        let owner = EntityId::new(3, 0);
        let ctx = PhaseContext::new(
            ContextId(1),
            &BlockTickPhase,
            ContextBuilder::new()
                .cause(Cause::Tick(9))
                .notifier(CellPos::new(1, 2, 3))
                .owner(owner),
        );
        let causes: Vec<&Cause> = ctx.cause().iter().collect();
        assert_eq!(
            causes,
            vec![
                &Cause::Tick(9),
                &Cause::Notifier(CellPos::new(1, 2, 3)),
                &Cause::Owner(owner)
            ]
        );
        assert_eq!(ctx.owner(), Some(owner));
    }

    #[test]
    fn transactors_close_innermost_first() {
        let mut ctx = ctx();
        ctx.open_transactor(1, "outer").unwrap();
        ctx.open_transactor(2, "inner").unwrap();
        assert_eq!(ctx.open_steps(), vec!["outer", "inner"]);
        assert!(matches!(
            ctx.close_transactor(1),
            Err(TrackerError::TransactorOutOfOrder { .. })
        ));
        ctx.close_transactor(2).unwrap();
        ctx.close_transactor(1).unwrap();
        assert_eq!(ctx.open_transactors(), 0);
        let depths: Vec<usize> = ctx.step_log().iter().map(|r| r.depth).collect();
        assert_eq!(depths, vec![1, 0]);
    }

    #[test]
    fn idle_context_logs_no_steps() {
        let mut ctx = PhaseContext::new(ContextId(0), &crate::phases::IdlePhase, ContextBuilder::new());
        for id in 0..100 {
            ctx.open_transactor(id, "write-through").unwrap();
            ctx.close_transactor(id).unwrap();
        }
        assert_eq!(ctx.open_transactors(), 0);
        assert!(ctx.step_log().is_empty());
    }

    #[test]
    fn step_attribution_covers_nested_captures() {
        let mut ctx = ctx();
        ctx.open_transactor(1, "outer").unwrap();
        ctx.buffers_mut().push(cell_tx(0));
        ctx.open_transactor(2, "inner").unwrap();
        ctx.buffers_mut().push(cell_tx(1));
        ctx.close_transactor(2).unwrap();
        ctx.close_transactor(1).unwrap();
        assert_eq!(ctx.captured_by_step("inner"), vec![1]);
        assert_eq!(ctx.captured_by_step("outer"), vec![0, 1]);
    }

    #[test]
    fn closed_context_refuses_transactors() {
        let mut ctx = ctx();
        ctx.close();
        assert!(matches!(
            ctx.open_transactor(1, "late"),
            Err(TrackerError::ContextClosed { .. })
        ));
    }
}
