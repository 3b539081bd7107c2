//! Transaction journal: the outcome of every tracked mutation.
//!
//! The [`TransactionJournal`] records one [`JournalEntry`] per transaction
//! that reached a terminal state during an unwind: what it targeted, the
//! original and proposed states, whether it was committed, rolled back, or
//! discarded, which phase captured it, and the cause chain of the event it
//! was posted in.
//!
//! The tracker appends entries while unwinding. The journal keeps a bounded
//! rolling window (oldest entries are evicted first) so long-running
//! simulations do not grow it without limit.
//!
//! # Query API
//!
//! - **Target**: [`TransactionJournal::history_of`]
//! - **Phase**: [`TransactionJournal::entries_for_phase`]
//! - **Outcome**: [`TransactionJournal::entries_with_outcome`]
//! - **Unwind**: [`TransactionJournal::entries_for_unwind`]
//!
//! # Example
//!
//! ```
//! use causa_journal::journal::{JournalEntry, Outcome, TransactionJournal};
//! use causa_world::prelude::*;
//!
//! let mut journal = TransactionJournal::new();
//! let target = Target::Cell(CellPos::new(5, 64, 10));
//!
//! journal.record(JournalEntry {
//!     sequence: 0,
//!     kind: TransactionKind::CellChange,
//!     target,
//!     original: State::Block(BlockState::AIR),
//!     proposed: State::Block(BlockState::WATER),
//!     outcome: Outcome::Committed,
//!     phase: "block-tick".to_owned(),
//!     cause: CauseChain::new().with(Cause::Tick(1)),
//!     unwind: 1,
//! });
//!
//! assert_eq!(journal.len(), 1);
//! assert_eq!(journal.history_of(&target).count(), 1);
//! ```

use std::collections::VecDeque;

use causa_world::cause::CauseChain;
use causa_world::state::{State, Target};
use causa_world::transaction::{TransactionKind, TransactionStatus};
use serde::{Deserialize, Serialize};

/// Default number of entries retained before the oldest are evicted.
pub const DEFAULT_RETENTION: usize = 65_536;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a transaction left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// The proposed state was written.
    Committed,
    /// The original state was written back.
    RolledBack,
    /// The restore write failed because the target was gone; the rollback
    /// was a no-op.
    RollbackMissed,
    /// Dropped without ever being written.
    Discarded,
}

impl Outcome {
    /// Map a terminal transaction status to an outcome.
    ///
    /// Returns `None` for non-terminal statuses. A missed rollback cannot be
    /// told apart from the status alone; callers record it explicitly.
    pub fn from_status(status: TransactionStatus) -> Option<Outcome> {
        match status {
            TransactionStatus::Committed => Some(Outcome::Committed),
            TransactionStatus::RolledBack => Some(Outcome::RolledBack),
            TransactionStatus::Discarded => Some(Outcome::Discarded),
            TransactionStatus::Captured
            | TransactionStatus::Valid
            | TransactionStatus::Invalid => None,
        }
    }

    /// Whether the proposed state ended up in the world.
    pub fn took_effect(self) -> bool {
        self == Outcome::Committed
    }
}

// ---------------------------------------------------------------------------
// JournalEntry
// ---------------------------------------------------------------------------

/// One terminal transaction with full attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Capture sequence number (monotonic per tracker).
    pub sequence: u64,
    pub kind: TransactionKind,
    pub target: Target,
    pub original: State,
    pub proposed: State,
    pub outcome: Outcome,
    /// Name of the phase whose context captured the transaction.
    pub phase: String,
    /// Cause chain of the event the transaction was posted in.
    pub cause: CauseChain,
    /// Which unwind (monotonic per tracker) produced the entry.
    pub unwind: u64,
}

// ---------------------------------------------------------------------------
// TransactionJournal
// ---------------------------------------------------------------------------

/// Rolling, queryable record of transaction outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionJournal {
    entries: VecDeque<JournalEntry>,
    retention: usize,
    evicted: u64,
}

impl TransactionJournal {
    /// A journal keeping [`DEFAULT_RETENTION`] entries.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// A journal keeping at most `retention` entries (at least one).
    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retention: retention.max(1),
            evicted: 0,
        }
    }

    /// Append an entry, evicting the oldest one if the window is full.
    pub fn record(&mut self, entry: JournalEntry) {
        if self.entries.len() == self.retention {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many entries have been evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    /// Every retained entry touching `target`, oldest first.
    pub fn history_of<'a>(&'a self, target: &'a Target) -> impl Iterator<Item = &'a JournalEntry> {
        self.entries.iter().filter(move |e| &e.target == target)
    }

    /// Entries captured by the named phase.
    pub fn entries_for_phase<'a>(
        &'a self,
        phase: &'a str,
    ) -> impl Iterator<Item = &'a JournalEntry> {
        self.entries.iter().filter(move |e| e.phase == phase)
    }

    /// Entries with the given outcome.
    pub fn entries_with_outcome(&self, outcome: Outcome) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter().filter(move |e| e.outcome == outcome)
    }

    /// Entries produced by one unwind, in the order they were recorded.
    pub fn entries_for_unwind(&self, unwind: u64) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter().filter(move |e| e.unwind == unwind)
    }

    /// The last state committed at `target`, if the journal still holds it.
    pub fn last_committed(&self, target: &Target) -> Option<&State> {
        self.entries
            .iter()
            .rev()
            .find(|e| &e.target == target && e.outcome == Outcome::Committed)
            .map(|e| &e.proposed)
    }
}

impl Default for TransactionJournal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
