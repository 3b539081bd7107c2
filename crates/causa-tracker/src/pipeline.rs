//! Mutation pipelines.
//!
//! A [`Pipeline`] is an immutable, ordered list of [`SideEffect`] steps that
//! together produce one mutation's final state. Steps run in declared order
//! until one returns [`EffectResult::Done`]; later steps never run. If no
//! step produces a result, the caller's default is returned.
//!
//! Each step runs inside its own [`EffectTransactor`], which is closed before
//! the next step starts, whether the step succeeded or failed. A failing step
//! has everything it captured discarded (earlier steps keep theirs) and its
//! error is returned as a [`PipelineError`]. When the run ends, failed or
//! not, every transaction it captured is sealed: its proposed state is final.
//!
//! Pipelines hold no mutable state and can be shared and reused freely.
//!
//! [`EffectTransactor`]: crate::transactor::EffectTransactor

use std::fmt;

use causa_world::access::WorldAccess;
use causa_world::state::{State, Target};
use causa_world::transaction::{TransactionError, TransactionKind};
use causa_world::WorldError;
use tracing::warn;

use crate::synthesis;
use crate::tracker::{PhaseTracker, Proposal};
use crate::TrackerError;

// ---------------------------------------------------------------------------
// EffectResult / PipelineCursor
// ---------------------------------------------------------------------------

/// What one step decided.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectResult {
    /// Defer to the next step.
    Pass,
    /// Stop the pipeline with this state.
    Done(State),
}

impl EffectResult {
    pub fn has_result(&self) -> bool {
        matches!(self, EffectResult::Done(_))
    }
}

/// The in-progress view of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineCursor {
    /// What is being mutated.
    pub target: Target,
    /// State at the start of the run.
    pub initial: State,
    /// State as the steps so far have left it.
    pub state: State,
    /// Sequence of the transaction this run captured, if any.
    pub captured: Option<u64>,
}

impl PipelineCursor {
    pub fn new(target: Target, initial: State) -> Self {
        Self {
            target,
            state: initial.clone(),
            initial,
            captured: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EffectContext
// ---------------------------------------------------------------------------

/// What a step may touch: the tracker (through its transactor) and the world.
pub struct EffectContext<'a> {
    tracker: &'a mut PhaseTracker,
    world: &'a mut dyn WorldAccess,
}

impl<'a> EffectContext<'a> {
    pub fn new(tracker: &'a mut PhaseTracker, world: &'a mut dyn WorldAccess) -> Self {
        Self { tracker, world }
    }

    pub fn tracker(&mut self) -> &mut PhaseTracker {
        &mut *self.tracker
    }

    pub fn world(&mut self) -> &mut dyn WorldAccess {
        &mut *self.world
    }

    /// Both halves at once, for running nested pipelines.
    pub fn split(&mut self) -> (&mut PhaseTracker, &mut dyn WorldAccess) {
        (&mut *self.tracker, &mut *self.world)
    }

    /// Pending-aware read of `target`.
    pub fn read_state(&self, target: &Target) -> Result<State, WorldError> {
        self.tracker.read_state(&*self.world, target)
    }

    pub fn captures(&self, kind: TransactionKind) -> bool {
        self.tracker.captures(kind)
    }

    pub fn capture(&mut self, proposal: Proposal) -> Result<u64, TrackerError> {
        self.tracker.capture(proposal)
    }
}

// ---------------------------------------------------------------------------
// SideEffect
// ---------------------------------------------------------------------------

/// Errors a step may fail with.
#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The step refused the mutation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A nested pipeline run by the step failed.
    #[error(transparent)]
    Nested(Box<PipelineError>),
}

impl EffectError {
    /// Whether a fatal tracker error is in the chain.
    pub fn is_fatal(&self) -> bool {
        match self {
            EffectError::Tracker(e) => e.is_fatal(),
            EffectError::Nested(inner) => inner.is_fatal(),
            EffectError::World(_) | EffectError::Transaction(_) | EffectError::Rejected(_) => {
                false
            }
        }
    }
}

/// One step of a [`Pipeline`] with arguments `A`.
pub trait SideEffect<A>: Send + Sync {
    fn name(&self) -> &str;

    fn process(
        &self,
        cx: &mut EffectContext<'_>,
        cursor: &mut PipelineCursor,
        args: &A,
    ) -> Result<EffectResult, EffectError>;
}

/// A step built from a closure.
pub struct FnEffect<F> {
    name: String,
    f: F,
}

impl<A, F> SideEffect<A> for FnEffect<F>
where
    F: Fn(&mut EffectContext<'_>, &mut PipelineCursor, &A) -> Result<EffectResult, EffectError>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        &self,
        cx: &mut EffectContext<'_>,
        cursor: &mut PipelineCursor,
        args: &A,
    ) -> Result<EffectResult, EffectError> {
        (self.f)(cx, cursor, args)
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// A pipeline run stopped at a failing step.
#[derive(Debug, thiserror::Error)]
#[error("pipeline `{pipeline}` failed at step `{step}`: {source}")]
pub struct PipelineError {
    pub pipeline: String,
    pub step: String,
    /// Sequences the failing step had captured; they were discarded.
    pub discarded: Vec<u64>,
    #[source]
    pub source: EffectError,
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        self.source.is_fatal()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An immutable sequence of steps.
pub struct Pipeline<A> {
    name: String,
    steps: Vec<Box<dyn SideEffect<A>>>,
}

impl<A: 'static> Pipeline<A> {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<A> {
        PipelineBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }
}

impl<A> Pipeline<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run the pipeline for `target`, starting from `initial`.
    pub fn process(
        &self,
        tracker: &mut PhaseTracker,
        world: &mut dyn WorldAccess,
        target: Target,
        initial: State,
        args: &A,
        default: State,
    ) -> Result<State, PipelineError> {
        let context = tracker.current().id();
        let start = tracker.current().buffers().watermark();
        let mut cursor = PipelineCursor::new(target, initial);

        for step in &self.steps {
            let mut open_error = None;
            let Ok(mut transactor) = tracker
                .open_transactor(step.name())
                .map_err(|e| open_error = Some(e))
            else {
                let e = open_error.expect("open_transactor returned Err");
                tracker.seal_since(context, start);
                return Err(PipelineError {
                    pipeline: self.name.clone(),
                    step: step.name().to_owned(),
                    discarded: Vec::new(),
                    source: e.into(),
                });
            };
            let outcome = {
                let mut cx = EffectContext::new(&mut *transactor, &mut *world);
                step.process(&mut cx, &mut cursor, args)
            };
            match outcome {
                Ok(EffectResult::Pass) => {}
                Ok(EffectResult::Done(state)) => {
                    drop(transactor);
                    tracker.seal_since(context, start);
                    return Ok(state);
                }
                Err(source) => {
                    let discarded = transactor.rollback();
                    drop(transactor);
                    // Earlier steps' captures stay, frozen like after a run.
                    tracker.seal_since(context, start);
                    for tx in &discarded {
                        synthesis::release_reserved(world, tx);
                    }
                    let discarded: Vec<u64> = discarded.iter().map(|tx| tx.sequence()).collect();
                    warn!(
                        pipeline = %self.name,
                        step = step.name(),
                        discarded = discarded.len(),
                        error = %source,
                        "pipeline step failed; its captures were discarded"
                    );
                    return Err(PipelineError {
                        pipeline: self.name.clone(),
                        step: step.name().to_owned(),
                        discarded,
                        source,
                    });
                }
            }
        }

        tracker.seal_since(context, start);
        Ok(default)
    }
}

impl<A> fmt::Debug for Pipeline<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Accumulates steps for a [`Pipeline`].
pub struct PipelineBuilder<A> {
    name: String,
    steps: Vec<Box<dyn SideEffect<A>>>,
}

impl<A: 'static> PipelineBuilder<A> {
    pub fn step(mut self, step: impl SideEffect<A> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Add a step from a closure.
    pub fn step_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut EffectContext<'_>, &mut PipelineCursor, &A) -> Result<EffectResult, EffectError>
            + Send
            + Sync
            + 'static,
    {
        self.step(FnEffect {
            name: name.into(),
            f,
        })
    }

    pub fn build(self) -> Pipeline<A> {
        Pipeline {
            name: self.name,
            steps: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::phases::BlockTickPhase;
    use causa_world::memory::MemoryWorld;
    use causa_world::state::{BlockState, CellPos};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn target() -> Target {
        Target::Cell(CellPos::new(0, 64, 0))
    }

    fn capture_stone(cx: &mut EffectContext<'_>, cursor: &mut PipelineCursor) -> Result<u64, EffectError> {
        let seq = cx.capture(Proposal::new(
            TransactionKind::CellChange,
            cursor.target,
            cursor.state.clone(),
            State::Block(BlockState::STONE),
        ))?;
        cursor.state = State::Block(BlockState::STONE);
        Ok(seq)
    }

    #[test]
    fn default_returned_when_no_step_decides() {
        let pipeline: Pipeline<()> = Pipeline::builder("noop")
            .step_fn("pass", |_, _, _| Ok(EffectResult::Pass))
            .build();
        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let out = pipeline
            .process(
                &mut tracker,
                &mut world,
                target(),
                State::Block(BlockState::AIR),
                &(),
                State::Block(BlockState::WATER),
            )
            .unwrap();
        assert_eq!(out, State::Block(BlockState::WATER));
        assert!(tracker.current().step_log().is_empty());
    }

    #[test]
    fn failing_step_discards_only_its_own_captures() {
        let third = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&third);
        let pipeline: Pipeline<()> = Pipeline::builder("partial")
            .step_fn("keeps", |cx, cursor, _| {
                capture_stone(cx, cursor)?;
                Ok(EffectResult::Pass)
            })
            .step_fn("fails", |cx, cursor, _| {
                capture_stone(cx, cursor)?;
                Err(EffectError::Rejected("no".into()))
            })
            .step_fn("never", move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(EffectResult::Pass)
            })
            .build();

        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let _h = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        let err = pipeline
            .process(
                &mut tracker,
                &mut world,
                target(),
                State::Block(BlockState::AIR),
                &(),
                State::Block(BlockState::AIR),
            )
            .unwrap_err();
        assert_eq!(err.step, "fails");
        assert_eq!(err.discarded, vec![1]);
        assert!(!err.is_fatal());
        assert_eq!(third.load(Ordering::SeqCst), 0);

        let ctx = tracker.current();
        assert_eq!(ctx.buffers().len(), 1);
        assert_eq!(ctx.open_transactors(), 0);
        assert_eq!(ctx.step_log().len(), 2);
        assert!(matches!(
            tracker.amend_proposed(0, State::Block(BlockState::WATER)),
            Err(TrackerError::Transaction(TransactionError::Sealed { sequence: 0 }))
        ));
    }

    #[test]
    fn captures_are_sealed_after_run() {
        let pipeline: Pipeline<()> = Pipeline::builder("seal")
            .step_fn("capture", |cx, cursor, _| {
                let seq = capture_stone(cx, cursor)?;
                cursor.captured = Some(seq);
                cx.tracker().amend_proposed(seq, State::Block(BlockState::WATER))?;
                Ok(EffectResult::Done(State::Block(BlockState::WATER)))
            })
            .build();
        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let _h = tracker.push_phase(&BlockTickPhase, ContextBuilder::new()).unwrap();
        pipeline
            .process(
                &mut tracker,
                &mut world,
                target(),
                State::Block(BlockState::AIR),
                &(),
                State::Block(BlockState::AIR),
            )
            .unwrap();
        assert!(tracker
            .amend_proposed(0, State::Block(BlockState::STONE))
            .is_err());
    }
}
