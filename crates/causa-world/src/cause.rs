//! Causes: the ordered "why" attached to every captured mutation.
//!
//! A [`CauseChain`] is ordered root-first: the first element is the
//! outermost reason (e.g. the packet that arrived), later elements narrow it
//! down (the player who sent it, the cell that was notified). Domain events
//! carry the full chain so listeners can attribute a batch of mutations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::state::CellPos;

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// One link of a cause chain.
///
/// Prefer the most specific variant. `Event` is used for causes that only
/// exist as the name of an upstream event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cause {
    /// A connected player (by entity id).
    Player(EntityId),
    /// A non-player entity acting on its own.
    Entity(EntityId),
    /// The cell whose update notified the current one.
    Notifier(CellPos),
    /// The entity that owns the affected object (e.g. who placed a block).
    Owner(EntityId),
    /// A plugin acting outside of gameplay.
    Plugin(String),
    /// An inbound packet, by name.
    Packet(String),
    /// The simulation tick that scheduled the work.
    Tick(u64),
    /// An upstream event, by name.
    Event(String),
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Player(id) => write!(f, "player {id}"),
            Cause::Entity(id) => write!(f, "entity {id}"),
            Cause::Notifier(pos) => write!(f, "notifier {pos}"),
            Cause::Owner(id) => write!(f, "owner {id}"),
            Cause::Plugin(name) => write!(f, "plugin {name}"),
            Cause::Packet(name) => write!(f, "packet {name}"),
            Cause::Tick(tick) => write!(f, "tick {tick}"),
            Cause::Event(name) => write!(f, "event {name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CauseChain
// ---------------------------------------------------------------------------

/// Ordered list of causes, root cause first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseChain(Vec<Cause>);

impl CauseChain {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a narrower cause.
    pub fn push(&mut self, cause: Cause) {
        self.0.push(cause);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, cause: Cause) -> Self {
        self.0.push(cause);
        self
    }

    /// A new chain with every cause of `self` followed by every cause of
    /// `narrower`.
    pub fn joined(&self, narrower: &CauseChain) -> CauseChain {
        let mut out = self.0.clone();
        out.extend(narrower.0.iter().cloned());
        CauseChain(out)
    }

    /// The outermost cause, if any.
    pub fn root(&self) -> Option<&Cause> {
        self.0.first()
    }

    /// First cause matching `pred`, searching root-first.
    pub fn first_matching(&self, pred: impl Fn(&Cause) -> bool) -> Option<&Cause> {
        self.0.iter().find(|c| pred(c))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Cause> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Cause> for CauseChain {
    fn from_iter<I: IntoIterator<Item = Cause>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CauseChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<no cause>");
        }
        for (i, cause) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{cause}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
