//! Causa World -- value types for tracked world mutation.
//!
//! This crate holds everything the tracking engine and its collaborators
//! share: coordinates and targets, state snapshots, causes, the
//! [`Transaction`](transaction::Transaction) record and its lifecycle,
//! per-kind [`CaptureBuffers`](capture::CaptureBuffers), and the
//! [`WorldAccess`](access::WorldAccess) seam through which every commit and
//! rollback reaches real world state.
//!
//! # Quick Start
//!
//! ```
//! use causa_world::prelude::*;
//!
//! let mut world = MemoryWorld::new();
//! let target = Target::Cell(CellPos::new(5, 64, 10));
//!
//! let mut tx = Transaction::new(
//!     TransactionKind::CellChange,
//!     target,
//!     world.read_state(&target).unwrap(),
//!     State::Block(BlockState::WATER),
//!     0,
//! );
//! tx.transition(TransactionStatus::Valid).unwrap();
//! world.write_state(tx.target(), tx.proposed(), tx.flags()).unwrap();
//! tx.transition(TransactionStatus::Committed).unwrap();
//!
//! assert_eq!(world.block_at(CellPos::new(5, 64, 10)), BlockState::WATER);
//! ```

#![deny(unsafe_code)]

pub mod access;
pub mod capture;
pub mod cause;
pub mod entity;
pub mod memory;
pub mod state;
pub mod transaction;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by world accessors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    /// The target does not exist any more (e.g. its holder was removed).
    #[error("target {target} no longer exists")]
    TargetMissing { target: state::Target },

    /// The chunk holding the cell is not loaded.
    #[error("cell {pos} is in an unloaded chunk")]
    Unloaded { pos: state::CellPos },

    /// The state does not have the shape the target requires.
    #[error("state {state:?} cannot be stored at {target}")]
    StateMismatch {
        target: state::Target,
        state: state::State,
    },
}

impl WorldError {
    /// Whether the error means the target is gone (as opposed to a caller
    /// passing a malformed state).
    pub fn is_missing_target(&self) -> bool {
        matches!(
            self,
            WorldError::TargetMissing { .. } | WorldError::Unloaded { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::access::WorldAccess;
    pub use crate::capture::{CaptureBuffer, CaptureBuffers, Watermark};
    pub use crate::cause::{Cause, CauseChain};
    pub use crate::entity::{EntityAllocator, EntityId};
    pub use crate::memory::{MemoryWorld, WriteRecord};
    pub use crate::state::{
        BlockState, CellPos, ChangeFlags, EntitySnapshot, ItemStack, State, Target,
    };
    pub use crate::transaction::{
        Transaction, TransactionError, TransactionKind, TransactionStatus,
    };
    pub use crate::WorldError;
}
