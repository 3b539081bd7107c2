//! Capture buffers: deferred, ordered collections of transactions.
//!
//! Each phase context owns one [`CaptureBuffers`] set with a
//! [`CaptureBuffer`] per [`TransactionKind`]. Nothing in a buffer has touched
//! the world yet; the buffers are drained exactly once, when the owning
//! context unwinds.
//!
//! A [`Watermark`] records the length of every buffer at one instant. Effect
//! transactors take one when they open so a failing step can discard exactly
//! what it captured, and so diagnostics can attribute transactions to the
//! step that produced them.

use serde::{Deserialize, Serialize};

use crate::state::{State, Target};
use crate::transaction::{Transaction, TransactionKind};

// ---------------------------------------------------------------------------
// CaptureBuffer
// ---------------------------------------------------------------------------

/// Transactions of one kind, in capture order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBuffer {
    kind: TransactionKind,
    entries: Vec<Transaction>,
}

impl CaptureBuffer {
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transaction> {
        self.entries.iter()
    }

    fn push(&mut self, tx: Transaction) {
        debug_assert_eq!(tx.kind(), self.kind, "transaction filed in wrong buffer");
        self.entries.push(tx);
    }
}

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

/// Buffer lengths at one instant, indexed by [`TransactionKind::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermark([usize; 4]);

impl Watermark {
    /// Length of the `kind` buffer when the watermark was taken.
    pub fn at(&self, kind: TransactionKind) -> usize {
        self.0[kind.index()]
    }
}

// ---------------------------------------------------------------------------
// CaptureBuffers
// ---------------------------------------------------------------------------

/// One [`CaptureBuffer`] per transaction kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBuffers {
    buffers: [CaptureBuffer; 4],
}

impl CaptureBuffers {
    pub fn new() -> Self {
        Self {
            buffers: TransactionKind::ALL.map(CaptureBuffer::new),
        }
    }

    pub fn buffer(&self, kind: TransactionKind) -> &CaptureBuffer {
        &self.buffers[kind.index()]
    }

    /// File a transaction into the buffer of its kind.
    pub fn push(&mut self, tx: Transaction) {
        self.buffers[tx.kind().index()].push(tx);
    }

    /// Total number of buffered transactions.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(CaptureBuffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(CaptureBuffer::is_empty)
    }

    /// Snapshot the current buffer lengths.
    pub fn watermark(&self) -> Watermark {
        Watermark(std::array::from_fn(|i| self.buffers[i].len()))
    }

    /// Transactions captured after `mark`, in capture order.
    pub fn since(&self, mark: Watermark) -> Vec<&Transaction> {
        let mut out: Vec<&Transaction> = self
            .buffers
            .iter()
            .flat_map(|b| b.entries.iter().skip(mark.at(b.kind)))
            .collect();
        out.sort_by_key(|tx| tx.sequence());
        out
    }

    /// Remove every transaction captured after `mark` and return them in
    /// capture order.
    pub fn truncate_to(&mut self, mark: Watermark) -> Vec<Transaction> {
        let mut removed = Vec::new();
        for buffer in &mut self.buffers {
            let keep = mark.at(buffer.kind).min(buffer.entries.len());
            removed.extend(buffer.entries.drain(keep..));
        }
        removed.sort_by_key(Transaction::sequence);
        removed
    }

    /// Seal every transaction captured after `mark`.
    pub fn seal_since(&mut self, mark: Watermark) {
        for buffer in &mut self.buffers {
            let from = mark.at(buffer.kind).min(buffer.entries.len());
            for tx in &mut buffer.entries[from..] {
                tx.seal();
            }
        }
    }

    /// Mutable access to a still-buffered transaction by sequence number.
    pub fn find_mut(&mut self, sequence: u64) -> Option<&mut Transaction> {
        self.buffers
            .iter_mut()
            .flat_map(|b| b.entries.iter_mut())
            .find(|tx| tx.sequence() == sequence)
    }

    /// The most recently captured proposed state for `target`, if any.
    pub fn latest_proposed(&self, target: &Target) -> Option<&State> {
        self.buffers
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|tx| tx.target() == target)
            .max_by_key(|tx| tx.sequence())
            .map(Transaction::proposed)
    }

    /// Take every buffered transaction of `kind`, in capture order.
    pub fn drain(&mut self, kind: TransactionKind) -> Vec<Transaction> {
        std::mem::take(&mut self.buffers[kind.index()].entries)
    }

    /// Take every buffered transaction, in capture order.
    pub fn drain_all(&mut self) -> Vec<Transaction> {
        let mut all: Vec<Transaction> = self
            .buffers
            .iter_mut()
            .flat_map(|b| std::mem::take(&mut b.entries))
            .collect();
        all.sort_by_key(Transaction::sequence);
        all
    }
}

impl Default for CaptureBuffers {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
