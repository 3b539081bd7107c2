//! Transactions: individually revocable world mutations.
//!
//! A [`Transaction`] is the atomic unit of tracked mutation. It records the
//! target, the state found there when the mutation was captured, and the
//! state the simulation wants to put there. Transactions are created by
//! pipeline steps, owned by the capture buffers of the phase context that was
//! active at capture time, and consumed exactly once when that context
//! unwinds.
//!
//! # Lifecycle
//!
//! ```text
//! Captured --> Valid   --> Committed
//!          |          \--> Discarded
//!          |-> Invalid --> RolledBack
//!          |          \--> Discarded
//!          \-> Discarded
//! ```
//!
//! The decision (`Valid`/`Invalid`) is taken once, after every listener has
//! seen the transaction. Every transition is checked by
//! [`Transaction::transition`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::{ChangeFlags, State, Target};

// ---------------------------------------------------------------------------
// TransactionKind
// ---------------------------------------------------------------------------

/// The closed set of mutation kinds the engine tracks.
///
/// The declaration order is the capture-buffer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// A cell's block state changes.
    CellChange,
    /// A new entity enters the world.
    EntitySpawn,
    /// An item entity is dropped into the world.
    ItemDrop,
    /// An inventory slot changes as the result of an interaction.
    InteractionResult,
}

impl TransactionKind {
    /// Every kind, in buffer order.
    pub const ALL: [TransactionKind; 4] = [
        TransactionKind::CellChange,
        TransactionKind::EntitySpawn,
        TransactionKind::ItemDrop,
        TransactionKind::InteractionResult,
    ];

    /// Dense index into per-kind arrays.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            TransactionKind::CellChange => 0,
            TransactionKind::EntitySpawn => 1,
            TransactionKind::ItemDrop => 2,
            TransactionKind::InteractionResult => 3,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::CellChange => "cell-change",
            TransactionKind::EntitySpawn => "entity-spawn",
            TransactionKind::ItemDrop => "item-drop",
            TransactionKind::InteractionResult => "interaction-result",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// TransactionStatus
// ---------------------------------------------------------------------------

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Recorded in a capture buffer; no decision yet.
    Captured,
    /// Listeners accepted it; waiting to be written.
    Valid,
    /// Listeners (or event cancellation) rejected it; waiting to be restored.
    Invalid,
    /// The proposed state was written to the world. Terminal.
    Committed,
    /// The original state was restored. Terminal.
    RolledBack,
    /// Dropped without touching the world: it depended on an invalidated
    /// target, its commit write was refused, or its phase failed to unwind.
    /// Terminal.
    Discarded,
}

impl TransactionStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::RolledBack
                | TransactionStatus::Discarded
        )
    }

    fn allows(self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, to),
            (Captured, Valid)
                | (Captured, Invalid)
                | (Captured, Discarded)
                | (Valid, Committed)
                | (Valid, Discarded)
                | (Invalid, RolledBack)
                | (Invalid, Discarded)
        )
    }
}

/// Errors produced by transaction bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// A lifecycle transition that the state machine forbids.
    #[error("transaction #{sequence} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        sequence: u64,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// An attempt to replace the proposed state after capture completed.
    #[error("transaction #{sequence} is sealed; its proposed state can no longer change")]
    Sealed { sequence: u64 },

    /// A replacement proposed state of the wrong shape for the target.
    #[error("state {state:?} does not fit target {target}")]
    StateMismatch { target: Target, state: State },
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// One proposed, individually revocable world mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    kind: TransactionKind,
    target: Target,
    original: State,
    proposed: State,
    /// The target whose mutation produced this one (e.g. the cell an item
    /// drop fell out of). Invalidating that target discards this transaction.
    related: Option<Target>,
    flags: ChangeFlags,
    sequence: u64,
    status: TransactionStatus,
    sealed: bool,
    /// The original was read from an enclosing context's pending capture,
    /// not from the world.
    #[serde(default)]
    pending_original: bool,
}

impl Transaction {
    /// Create a captured transaction. The sequence number is assigned by the
    /// capturing tracker.
    pub fn new(
        kind: TransactionKind,
        target: Target,
        original: State,
        proposed: State,
        sequence: u64,
    ) -> Self {
        Self {
            kind,
            target,
            original,
            proposed,
            related: None,
            flags: ChangeFlags::DEFAULT,
            sequence,
            status: TransactionStatus::Captured,
            sealed: false,
            pending_original: false,
        }
    }

    /// Mark the original as taken from a capture that has not been
    /// committed yet. Reverting such a transaction leaves the world alone.
    pub fn from_pending(mut self) -> Self {
        self.pending_original = true;
        self
    }

    /// Attach the target this transaction depends on.
    pub fn related_to(mut self, related: Target) -> Self {
        self.related = Some(related);
        self
    }

    /// Set the flags used when committing.
    pub fn with_flags(mut self, flags: ChangeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn original(&self) -> &State {
        &self.original
    }

    pub fn proposed(&self) -> &State {
        &self.proposed
    }

    pub fn related(&self) -> Option<&Target> {
        self.related.as_ref()
    }

    pub fn flags(&self) -> ChangeFlags {
        self.flags
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn original_is_pending(&self) -> bool {
        self.pending_original
    }

    /// Replace the proposed state. Only allowed until the capturing pipeline
    /// run seals the transaction.
    pub fn replace_proposed(&mut self, state: State) -> Result<(), TransactionError> {
        if self.sealed {
            return Err(TransactionError::Sealed {
                sequence: self.sequence,
            });
        }
        if !state.fits(&self.target) {
            return Err(TransactionError::StateMismatch {
                target: self.target,
                state,
            });
        }
        self.proposed = state;
        Ok(())
    }

    /// Freeze the proposed state.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Move to `to`, enforcing the lifecycle.
    pub fn transition(&mut self, to: TransactionStatus) -> Result<(), TransactionError> {
        if !self.status.allows(to) {
            return Err(TransactionError::IllegalTransition {
                sequence: self.sequence,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
