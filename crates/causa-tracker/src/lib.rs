//! Causa Tracker -- phase tracking, deferred capture and transactional
//! rollback of world mutations.
//!
//! Every mutation a simulation makes goes through a [`Pipeline`] while some
//! [`Phase`] is on top of the [`PhaseTracker`]'s stack. Instead of touching
//! the world, the pipeline records a [`Transaction`] in the current
//! [`PhaseContext`]. When the phase is popped, its transactions are grouped
//! into [`DomainEvent`]s and posted to the [`EventBus`]; listeners may
//! cancel events or invalidate single transactions. Invalid transactions are
//! restored in reverse capture order, the rest are committed in capture
//! order, and every outcome lands in the [`TransactionJournal`].
//!
//! # Quick Start
//!
//! ```
//! use causa_tracker::prelude::*;
//!
//! let mut tracker = PhaseTracker::default();
//! let mut world = MemoryWorld::new();
//! let mut bus = EventBus::new();
//! let pipelines = StandardPipelines::new(|_block: &BlockState| Vec::new());
//!
//! bus.subscribe("no-water", Order::Default, EventFilter::All, |event| {
//!     if event.transactions().iter().any(|tx| tx.proposed() == &State::Block(BlockState::WATER)) {
//!         event.set_cancelled(true);
//!     }
//!     Ok(())
//! });
//!
//! let pos = CellPos::new(5, 64, 10);
//! let (_, report) = tracker
//!     .scope(&BlockTickPhase, ContextBuilder::new().cause(Cause::Tick(1)), &mut world, &mut bus, |tracker, world| {
//!         pipelines.set_block(tracker, world, pos, BlockState::WATER)
//!     })
//!     .unwrap();
//!
//! assert_eq!(report.rolled_back.len(), 1);
//! assert_eq!(world.block_at(pos), BlockState::AIR);
//! ```
//!
//! [`Pipeline`]: pipeline::Pipeline
//! [`Phase`]: phase::Phase
//! [`PhaseTracker`]: tracker::PhaseTracker
//! [`Transaction`]: causa_world::transaction::Transaction
//! [`PhaseContext`]: context::PhaseContext
//! [`DomainEvent`]: event::DomainEvent
//! [`EventBus`]: event::EventBus
//! [`TransactionJournal`]: causa_journal::journal::TransactionJournal

#![deny(unsafe_code)]

pub mod cause_stack;
pub mod config;
pub mod context;
pub mod effects;
pub mod event;
pub mod phase;
pub mod phases;
pub mod pipeline;
pub mod synthesis;
pub mod tracker;
pub mod transactor;

use std::thread::ThreadId;

use causa_world::transaction::{TransactionError, TransactionKind};

use crate::context::ContextId;

/// Re-export the world crate for convenience.
pub use causa_world;

/// Re-export the journal crate for convenience.
pub use causa_journal;

// ---------------------------------------------------------------------------
// TrackerError
// ---------------------------------------------------------------------------

/// Errors produced by the phase tracker.
///
/// Fatal errors ([`TrackerError::is_fatal`]) mean the caller broke the stack
/// discipline. They are always returned, never logged and swallowed, and the
/// current tick must not continue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// The current phase does not allow `to` to be pushed on top of it.
    #[error("phase `{from}` cannot switch to `{to}`")]
    IllegalSwitch {
        from: &'static str,
        to: &'static str,
    },

    /// Pushing would exceed `max_depth`.
    #[error("pushing `{phase}` would exceed the maximum stack depth of {limit}")]
    DepthExceeded { phase: &'static str, limit: usize },

    /// A pop whose handle is not the top of the stack.
    #[error("cannot pop {handle}: {top} is on top of the stack")]
    OutOfOrderPop { handle: ContextId, top: ContextId },

    /// The context was already popped (or never existed on this tracker).
    #[error("{id} is closed")]
    ContextClosed { id: ContextId },

    /// A pop while effect transactors are still open on the context.
    #[error("cannot pop {context} (`{phase}`): {open} effect transactor(s) still open")]
    DanglingTransactor {
        context: ContextId,
        phase: &'static str,
        open: usize,
    },

    /// A transactor closed while a transactor opened after it is still open.
    #[error("transactor {transactor} on {context} closed out of order (innermost open: {innermost:?})")]
    TransactorOutOfOrder {
        context: ContextId,
        transactor: u64,
        innermost: Option<u64>,
    },

    /// A mutating call from a thread other than the tracker's owner.
    #[error("tracker owned by {owner:?} called from {caller:?}")]
    WrongThread { owner: ThreadId, caller: ThreadId },

    /// A cause frame popped while a newer frame is still pushed.
    #[error("cause frame {frame} popped while frame {top} is on top")]
    CauseFrameOutOfOrder { frame: u64, top: u64 },

    /// The current phase does not capture this kind of mutation.
    #[error("phase `{phase}` does not capture {kind}")]
    NotCapturing {
        phase: &'static str,
        kind: TransactionKind,
    },

    /// No open transaction with this sequence in the current context.
    #[error("no open transaction #{sequence} in the current context")]
    UnknownTransaction { sequence: u64 },

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("invalid tracker configuration: {0}")]
    InvalidConfig(String),
}

impl TrackerError {
    /// Whether the error is a stack-discipline violation that must abort the
    /// current tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            TrackerError::OutOfOrderPop { .. }
            | TrackerError::ContextClosed { .. }
            | TrackerError::DanglingTransactor { .. }
            | TrackerError::TransactorOutOfOrder { .. }
            | TrackerError::WrongThread { .. }
            | TrackerError::CauseFrameOutOfOrder { .. } => true,
            TrackerError::Transaction(TransactionError::IllegalTransition { .. }) => true,
            TrackerError::IllegalSwitch { .. }
            | TrackerError::DepthExceeded { .. }
            | TrackerError::NotCapturing { .. }
            | TrackerError::UnknownTransaction { .. }
            | TrackerError::Transaction(_)
            | TrackerError::InvalidConfig(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common tracker usage.
pub mod prelude {
    pub use causa_world::prelude::*;

    pub use causa_journal::journal::{JournalEntry, Outcome, TransactionJournal};

    pub use crate::cause_stack::{CauseFrameHandle, CauseStack};
    pub use crate::config::TrackerConfig;
    pub use crate::context::{ContextBuilder, ContextId, PhaseContext, StepRecord};
    pub use crate::effects::{
        block_change_pipeline, entity_spawn_pipeline, interaction_pipeline, item_drop_pipeline,
        BlockChange, CaptureChange, CommitProposed, DropsOnBreak, ItemDrop, Mutation,
        SkipUnchanged, SlotChange, Spawn, StandardPipelines,
    };
    pub use crate::event::{
        DomainEvent, EventBus, EventFilter, EventType, ListenerFailure, ListenerId, Order,
    };
    pub use crate::phase::Phase;
    pub use crate::phases::{
        BlockTickPhase, EntityTickPhase, ExplosionPhase, IdlePhase, PacketPhase, PluginPhase,
    };
    pub use crate::pipeline::{
        EffectContext, EffectError, EffectResult, Pipeline, PipelineBuilder, PipelineCursor,
        PipelineError, SideEffect,
    };
    pub use crate::synthesis::{classify, standard_events, UnwindReport};
    pub use crate::tracker::{PhaseHandle, PhaseTracker, Proposal};
    pub use crate::transactor::EffectTransactor;
    pub use crate::TrackerError;
}
