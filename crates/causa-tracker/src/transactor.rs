//! Effect transactors: RAII scopes around one pipeline step.
//!
//! Opening a transactor records a watermark of the current context's capture
//! buffers. Dropping it closes the scope, on every exit path, and logs which
//! transactions the step captured. While open, the transactor dereferences to
//! the [`PhaseTracker`], so the step keeps full access to the tracker
//! (including running nested pipelines, whose transactors must close first).

use std::ops::{Deref, DerefMut};

use causa_world::capture::Watermark;
use causa_world::transaction::Transaction;
use tracing::error;

use crate::context::ContextId;
use crate::tracker::PhaseTracker;

/// Guard for one open effect scope.
#[must_use = "dropping a transactor closes it immediately"]
pub struct EffectTransactor<'t> {
    tracker: &'t mut PhaseTracker,
    context: ContextId,
    id: u64,
    mark: Watermark,
}

impl<'t> EffectTransactor<'t> {
    pub(crate) fn new(
        tracker: &'t mut PhaseTracker,
        context: ContextId,
        id: u64,
        mark: Watermark,
    ) -> Self {
        Self {
            tracker,
            context,
            id,
            mark,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The context this transactor was opened on.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Buffer lengths when the transactor opened.
    pub fn watermark(&self) -> Watermark {
        self.mark
    }

    /// Step-local rollback: remove every transaction captured on this
    /// transactor's context since it opened, and return them in capture
    /// order. Earlier steps of the same pipeline run are untouched.
    pub fn rollback(&mut self) -> Vec<Transaction> {
        self.tracker.truncate_context(self.context, self.mark)
    }
}

impl Deref for EffectTransactor<'_> {
    type Target = PhaseTracker;

    fn deref(&self) -> &PhaseTracker {
        &*self.tracker
    }
}

impl DerefMut for EffectTransactor<'_> {
    fn deref_mut(&mut self) -> &mut PhaseTracker {
        &mut *self.tracker
    }
}

impl Drop for EffectTransactor<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.tracker.close_transactor(self.context, self.id) {
            if std::thread::panicking() {
                error!(error = %e, "effect transactor closed out of order during unwinding");
            } else {
                panic!("{e}");
            }
        }
    }
}
