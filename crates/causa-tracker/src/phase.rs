//! The [`Phase`] policy trait.
//!
//! A phase describes one category of simulation execution: a block tick, an
//! inbound packet, a plugin command, an explosion. It is a stateless strategy
//! object. Everything that changes while the phase runs lives in the
//! [`PhaseContext`] the tracker creates when the phase is pushed.
//!
//! Phases are handed to the tracker as `&'static dyn Phase`. Unit-struct
//! phases promote to `'static` directly:
//!
//! ```
//! use causa_tracker::prelude::*;
//!
//! let phase: &'static dyn Phase = &BlockTickPhase;
//! assert_eq!(phase.name(), "block-tick");
//! ```

use std::fmt;

use causa_world::transaction::TransactionKind;

use crate::context::PhaseContext;
use crate::event::DomainEvent;
use crate::synthesis;

/// Policy for one category of execution.
pub trait Phase: fmt::Debug + Send + Sync {
    /// Stable name used in logs, diagnostics and the journal.
    fn name(&self) -> &'static str;

    /// Whether mutations of `kind` are captured while this phase is on top.
    ///
    /// Kinds a phase does not capture are written straight through to the
    /// world by the pipelines.
    fn captures(&self, kind: TransactionKind) -> bool {
        let _ = kind;
        true
    }

    /// Whether `next` may be pushed while this phase is on top.
    fn can_switch_to(&self, next: &dyn Phase) -> bool {
        let _ = next;
        true
    }

    /// Turn the context's capture buffers into domain events.
    ///
    /// Called exactly once, after the context has been popped. The default
    /// drains every buffer and groups it with
    /// [`standard_events`](synthesis::standard_events). Anything a policy
    /// leaves in the buffers is discarded, never committed.
    fn unwind(&self, ctx: &mut PhaseContext) -> anyhow::Result<Vec<DomainEvent>> {
        Ok(synthesis::standard_events(ctx))
    }
}
