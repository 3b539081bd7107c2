//! Tracker configuration.
//!
//! [`TrackerConfig`] is a plain serde struct so embedders can load it from
//! whatever format their host already uses. Missing fields fall back to the
//! defaults below.

use serde::{Deserialize, Serialize};

use crate::TrackerError;

/// Tunables for one [`PhaseTracker`](crate::tracker::PhaseTracker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum number of contexts on the stack, the root included.
    pub max_depth: usize,
    /// With `verbose`, a push warns once the same phase already sits this
    /// many times on the stack.
    pub runaway_threshold: usize,
    /// Listener invocations slower than this are logged at `warn`.
    pub slow_listener_threshold_ms: u64,
    /// Extra diagnostics: runaway detection and per-event listings.
    pub verbose: bool,
    /// Append unwind outcomes to the tracker's journal.
    pub record_journal: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            runaway_threshold: 6,
            slow_listener_threshold_ms: 50,
            verbose: false,
            record_journal: true,
        }
    }
}

impl TrackerConfig {
    /// Reject settings the tracker cannot run with.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.max_depth == 0 {
            return Err(TrackerError::InvalidConfig(
                "max_depth must be at least 1 (the root context)".to_owned(),
            ));
        }
        Ok(())
    }
}
