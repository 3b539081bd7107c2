//! Domain events and the listener registry.
//!
//! At unwind, captured transactions are grouped into [`DomainEvent`]s and
//! posted, one at a time, to the [`EventBus`]. Listeners run synchronously in
//! [`Order`], then registration order. A listener may cancel the whole event
//! or invalidate individual member transactions; it can never change the
//! member list itself.
//!
//! # Example
//!
//! ```
//! use causa_tracker::prelude::*;
//!
//! let mut bus = EventBus::new();
//! bus.subscribe("no-water", Order::Default, EventFilter::only([EventType::PlaceBlock]), |event| {
//!     let flooded: Vec<u64> = event
//!         .transactions()
//!         .iter()
//!         .filter(|tx| tx.proposed() == &State::Block(BlockState::WATER))
//!         .map(|tx| tx.sequence())
//!         .collect();
//!     for sequence in flooded {
//!         event.invalidate(sequence);
//!     }
//!     Ok(())
//! });
//! assert_eq!(bus.len(), 1);
//! ```

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use causa_world::cause::CauseChain;
use causa_world::transaction::Transaction;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TrackerConfig;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// The kind of a domain event.
///
/// Declaration order is the posting order: at unwind, events are posted
/// sorted by type, and `Post` (the aggregate of everything that survived) is
/// always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Every cell destroyed by one explosion.
    Explode,
    /// Cells that became air.
    BreakBlock,
    /// Cells that were air and are now something else.
    PlaceBlock,
    /// Any other cell change.
    ModifyBlock,
    SpawnEntity,
    DropItem,
    /// Inventory slot changes resulting from an interaction.
    InteractItem,
    /// Aggregate of every transaction that survived the group events.
    Post,
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// A cancellable batch of transactions, as seen by listeners.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    event_type: EventType,
    cause: CauseChain,
    transactions: Vec<Transaction>,
    cancelled: bool,
    cancel_decided: bool,
    rejected: BTreeSet<u64>,
}

impl DomainEvent {
    pub fn new(event_type: EventType, transactions: Vec<Transaction>) -> Self {
        Self {
            event_type,
            cause: CauseChain::new(),
            transactions,
            cancelled: false,
            cancel_decided: false,
            rejected: BTreeSet::new(),
        }
    }

    /// Attach event-specific causes. The tracker prepends the ambient chain
    /// before posting.
    pub fn with_cause(mut self, cause: CauseChain) -> Self {
        self.cause = cause;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn cause(&self) -> &CauseChain {
        &self.cause
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Cancel (or explicitly un-cancel) the event. Only the first call has
    /// an effect.
    pub fn set_cancelled(&mut self, cancelled: bool) {
        if self.cancel_decided {
            debug!(
                event = ?self.event_type,
                ignored = cancelled,
                kept = self.cancelled,
                "cancellation already decided"
            );
            return;
        }
        self.cancelled = cancelled;
        self.cancel_decided = true;
    }

    /// Mark one member transaction valid or invalid. Returns `false` if
    /// `sequence` is not a member of this event.
    pub fn set_valid(&mut self, sequence: u64, valid: bool) -> bool {
        if !self.contains(sequence) {
            return false;
        }
        if valid {
            self.rejected.remove(&sequence);
        } else {
            self.rejected.insert(sequence);
        }
        true
    }

    /// Shorthand for `set_valid(sequence, false)`.
    pub fn invalidate(&mut self, sequence: u64) -> bool {
        self.set_valid(sequence, false)
    }

    /// Whether `sequence` survives this event: a member, not individually
    /// invalidated, and the event not cancelled.
    pub fn is_valid(&self, sequence: u64) -> bool {
        self.contains(sequence) && !self.cancelled && !self.rejected.contains(&sequence)
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.transactions.iter().any(|tx| tx.sequence() == sequence)
    }

    pub(crate) fn prepend_cause(&mut self, ambient: &CauseChain) {
        self.cause = ambient.joined(&self.cause);
    }

    /// Forget every listener decision: not cancelled, all members valid.
    pub(crate) fn reset_decisions(&mut self) {
        self.cancelled = false;
        self.cancel_decided = false;
        self.rejected.clear();
    }

    pub(crate) fn into_transactions(self) -> Vec<Transaction> {
        self.transactions
    }
}

// ---------------------------------------------------------------------------
// Listener registration
// ---------------------------------------------------------------------------

/// Coarse listener ordering. Ties run in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Order {
    First,
    Early,
    #[default]
    Default,
    Late,
    Last,
}

/// Which event types a listener receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(BTreeSet<EventType>),
}

impl EventFilter {
    pub fn only(types: impl IntoIterator<Item = EventType>) -> Self {
        EventFilter::Only(types.into_iter().collect())
    }

    pub fn accepts(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(types) => types.contains(&event_type),
        }
    }
}

/// A listener callback. Errors are reported as [`ListenerFailure`].
pub type Handler = Box<dyn FnMut(&mut DomainEvent) -> anyhow::Result<()> + Send>;

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    name: String,
    order: Order,
    filter: EventFilter,
    handler: Handler,
}

/// A listener returned an error while handling an event.
#[derive(Debug, thiserror::Error)]
#[error("listener `{listener}` failed on {event_type:?}: {error:#}")]
pub struct ListenerFailure {
    pub listener: String,
    pub event_type: EventType,
    pub error: anyhow::Error,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Synchronous listener registry.
pub struct EventBus {
    listeners: Vec<Listener>,
    next_id: u64,
    slow_threshold: Duration,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_slow_listener_threshold(Duration::from_millis(
            TrackerConfig::default().slow_listener_threshold_ms,
        ))
    }

    pub fn with_slow_listener_threshold(threshold: Duration) -> Self {
        Self {
            listeners: Vec::new(),
            next_id: 0,
            slow_threshold: threshold,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::with_slow_listener_threshold(Duration::from_millis(
            config.slow_listener_threshold_ms,
        ))
    }

    /// Register a listener.
    pub fn subscribe<F>(
        &mut self,
        name: impl Into<String>,
        order: Order,
        filter: EventFilter,
        handler: F,
    ) -> ListenerId
    where
        F: FnMut(&mut DomainEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        // After every listener of the same or an earlier order.
        let at = self.listeners.partition_point(|l| l.order <= order);
        self.listeners.insert(
            at,
            Listener {
                id,
                name: name.into(),
                order,
                filter,
                handler: Box::new(handler),
            },
        );
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Listener names in invocation order.
    pub fn listener_names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.name.as_str()).collect()
    }

    /// Deliver `event` to every interested listener. The first failing
    /// listener stops delivery.
    pub fn post(&mut self, event: &mut DomainEvent) -> Result<(), ListenerFailure> {
        let event_type = event.event_type();
        for listener in &mut self.listeners {
            if !listener.filter.accepts(event_type) {
                continue;
            }
            let started = Instant::now();
            let result = (listener.handler)(event);
            let elapsed = started.elapsed();
            if elapsed > self.slow_threshold {
                warn!(
                    listener = %listener.name,
                    event = ?event_type,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow listener"
                );
            }
            if let Err(error) = result {
                return Err(ListenerFailure {
                    listener: listener.name.clone(),
                    event_type,
                    error,
                });
            }
        }
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_names())
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}
