//! Event synthesis, rollback and commit.
//!
//! When a context is popped its phase turns the capture buffers into domain
//! events ([`standard_events`] is the usual policy). The tracker then hands
//! those events to [`resolve`], which:
//!
//! 1. sorts events by [`EventType`] (stable, so capture order survives inside
//!    a type) and attaches the ambient cause chain;
//! 2. posts each event; a failing listener is logged and the event is reset
//!    to "not cancelled, all members valid";
//! 3. posts one aggregate `Post` event holding every surviving transaction;
//! 4. decides every transaction exactly once (`Valid` or `Invalid`);
//! 5. discards valid transactions whose related target was invalidated;
//! 6. restores invalid transactions in reverse capture order;
//! 7. commits valid transactions in capture order;
//! 8. releases entity ids reserved for spawns that never happened and
//!    journals every outcome.
//!
//! Rollback is best effort: a restore write the world refuses (the target
//! vanished) is logged, counted as a missed rollback, and processing goes on.
//! A transaction whose original was read from an enclosing context's pending
//! capture is rolled back without a world write.
//!
//! Events must hold only `Captured` transactions. If the unwind policy hands
//! back anything already decided, the whole batch is discarded and the
//! report carries an unwind error.

use std::collections::{BTreeMap, BTreeSet};

use causa_journal::journal::{JournalEntry, Outcome, TransactionJournal};
use causa_world::access::WorldAccess;
use causa_world::cause::CauseChain;
use causa_world::state::{ChangeFlags, State, Target};
use causa_world::transaction::{Transaction, TransactionKind, TransactionStatus};
use tracing::{debug, error, warn};

use crate::context::{ContextId, PhaseContext};
use crate::event::{DomainEvent, EventBus, EventType, ListenerFailure};
use crate::TrackerError;

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// The event type a transaction belongs to under the standard policy.
pub fn classify(tx: &Transaction) -> EventType {
    match tx.kind() {
        TransactionKind::CellChange => {
            let was_air = tx.original().as_block().is_some_and(|b| b.is_air());
            let now_air = tx.proposed().as_block().is_some_and(|b| b.is_air());
            match (was_air, now_air) {
                (false, true) => EventType::BreakBlock,
                (true, false) => EventType::PlaceBlock,
                _ => EventType::ModifyBlock,
            }
        }
        TransactionKind::EntitySpawn => EventType::SpawnEntity,
        TransactionKind::ItemDrop => EventType::DropItem,
        TransactionKind::InteractionResult => EventType::InteractItem,
    }
}

/// Drain every buffer of `ctx` into one event per [`EventType`], in type
/// order, members in capture order.
pub fn standard_events(ctx: &mut PhaseContext) -> Vec<DomainEvent> {
    let mut groups: BTreeMap<EventType, Vec<Transaction>> = BTreeMap::new();
    for tx in ctx.buffers_mut().drain_all() {
        groups.entry(classify(&tx)).or_default().push(tx);
    }
    groups
        .into_iter()
        .map(|(event_type, txs)| DomainEvent::new(event_type, txs))
        .collect()
}

// ---------------------------------------------------------------------------
// UnwindReport
// ---------------------------------------------------------------------------

/// What one pop did to the world.
#[derive(Debug)]
pub struct UnwindReport {
    pub phase: &'static str,
    pub context: ContextId,
    /// Unwind serial number, as recorded in the journal.
    pub serial: u64,
    pub events_posted: usize,
    /// Committed sequences, in commit order.
    pub committed: Vec<u64>,
    /// Restored sequences, in restore order (reverse capture order).
    pub rolled_back: Vec<u64>,
    /// Invalid sequences whose restore write was refused.
    pub missed_rollbacks: Vec<u64>,
    pub discarded: Vec<u64>,
    pub listener_failures: Vec<ListenerFailure>,
    /// Set when the phase's unwind policy itself failed.
    pub unwind_error: Option<String>,
    /// Sequences the unwind policy left in the buffers.
    pub unprocessed: Vec<u64>,
}

impl UnwindReport {
    pub(crate) fn new(phase: &'static str, context: ContextId, serial: u64) -> Self {
        Self {
            phase,
            context,
            serial,
            events_posted: 0,
            committed: Vec::new(),
            rolled_back: Vec::new(),
            missed_rollbacks: Vec::new(),
            discarded: Vec::new(),
            listener_failures: Vec::new(),
            unwind_error: None,
            unprocessed: Vec::new(),
        }
    }

    /// No listener failed, the policy succeeded and drained everything.
    pub fn is_clean(&self) -> bool {
        self.listener_failures.is_empty()
            && self.unwind_error.is_none()
            && self.unprocessed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Per-pop state shared by [`resolve`] and [`discard`].
pub(crate) struct Unwinding<'a> {
    pub phase: &'static str,
    pub ambient: CauseChain,
    pub serial: u64,
    pub journal: Option<&'a mut TransactionJournal>,
}

impl Unwinding<'_> {
    fn record(&mut self, tx: &Transaction, outcome: Outcome, cause: &CauseChain) {
        if let Some(journal) = self.journal.as_deref_mut() {
            journal.record(JournalEntry {
                sequence: tx.sequence(),
                kind: tx.kind(),
                target: *tx.target(),
                original: tx.original().clone(),
                proposed: tx.proposed().clone(),
                outcome,
                phase: self.phase.to_owned(),
                cause: cause.clone(),
                unwind: self.serial,
            });
        }
    }
}

struct Member {
    tx: Transaction,
    cause: CauseChain,
}

fn post_event(phase: &str, bus: &mut EventBus, event: &mut DomainEvent, report: &mut UnwindReport) {
    report.events_posted += 1;
    if let Err(failure) = bus.post(event) {
        error!(
            phase = %phase,
            event = ?event.event_type(),
            cause = %event.cause(),
            listener = %failure.listener,
            error = %failure,
            "listener failed; event proceeds as not cancelled"
        );
        event.reset_decisions();
        report.listener_failures.push(failure);
    }
}

/// Post `events`, then roll back and commit their transactions.
pub(crate) fn resolve(
    unwinding: &mut Unwinding<'_>,
    mut events: Vec<DomainEvent>,
    world: &mut dyn WorldAccess,
    bus: &mut EventBus,
    report: &mut UnwindReport,
) -> Result<(), TrackerError> {
    let decided = events
        .iter()
        .flat_map(|e| e.transactions())
        .find(|tx| tx.status() != TransactionStatus::Captured)
        .map(|tx| (tx.sequence(), tx.status()));
    if let Some((sequence, status)) = decided {
        let message = format!(
            "unwind returned transaction {sequence} already {status:?}; event batch discarded"
        );
        error!(phase = %unwinding.phase, sequence, status = ?status, "{message}");
        report.unwind_error = Some(message);
        let txs = events
            .into_iter()
            .flat_map(DomainEvent::into_transactions)
            .collect();
        discard(unwinding, txs, world, report);
        return Ok(());
    }

    events.sort_by_key(DomainEvent::event_type);

    let mut members: Vec<Member> = Vec::new();
    let mut invalid: BTreeSet<u64> = BTreeSet::new();
    let mut seen: BTreeSet<u64> = BTreeSet::new();

    for mut event in events {
        event.prepend_cause(&unwinding.ambient);
        post_event(unwinding.phase, bus, &mut event, report);
        invalid.extend(
            event
                .transactions()
                .iter()
                .map(Transaction::sequence)
                .filter(|&seq| !event.is_valid(seq)),
        );
        let cause = event.cause().clone();
        for tx in event.into_transactions() {
            if !seen.insert(tx.sequence()) {
                warn!(
                    phase = %unwinding.phase,
                    sequence = tx.sequence(),
                    "transaction appeared in two events; later copy ignored"
                );
                continue;
            }
            members.push(Member {
                tx,
                cause: cause.clone(),
            });
        }
    }

    let survivors: Vec<Transaction> = members
        .iter()
        .filter(|m| !invalid.contains(&m.tx.sequence()))
        .map(|m| m.tx.clone())
        .collect();
    if !survivors.is_empty() {
        let mut post = DomainEvent::new(EventType::Post, survivors)
            .with_cause(unwinding.ambient.clone());
        post_event(unwinding.phase, bus, &mut post, report);
        invalid.extend(
            post.transactions()
                .iter()
                .map(Transaction::sequence)
                .filter(|&seq| !post.is_valid(seq)),
        );
    }

    members.sort_by_key(|m| m.tx.sequence());

    // Decide.
    for m in &mut members {
        let to = if invalid.contains(&m.tx.sequence()) {
            TransactionStatus::Invalid
        } else {
            TransactionStatus::Valid
        };
        m.tx.transition(to)?;
    }

    // Dependents of invalidated targets never reach the world.
    let mut dead: BTreeSet<Target> = members
        .iter()
        .filter(|m| m.tx.status() == TransactionStatus::Invalid)
        .map(|m| *m.tx.target())
        .collect();
    for m in &mut members {
        let orphaned = m.tx.status() == TransactionStatus::Valid
            && m.tx.related().is_some_and(|r| dead.contains(r));
        if orphaned {
            debug!(
                sequence = m.tx.sequence(),
                target = %m.tx.target(),
                "discarding transaction tied to an invalidated target"
            );
            m.tx.transition(TransactionStatus::Discarded)?;
            dead.insert(*m.tx.target());
        }
    }

    // Restore, last captured first.
    let mut missed: BTreeSet<u64> = BTreeSet::new();
    for m in members
        .iter_mut()
        .rev()
        .filter(|m| m.tx.status() == TransactionStatus::Invalid)
    {
        if m.tx.original_is_pending() {
            // The original only exists in an enclosing capture; the world
            // never saw it.
            debug!(
                sequence = m.tx.sequence(),
                target = %m.tx.target(),
                "restore of pending original left to the enclosing context"
            );
            report.rolled_back.push(m.tx.sequence());
            m.tx.transition(TransactionStatus::RolledBack)?;
            continue;
        }
        match world.write_state(m.tx.target(), m.tx.original(), ChangeFlags::RESTORE) {
            Ok(()) => report.rolled_back.push(m.tx.sequence()),
            Err(e) => {
                warn!(
                    phase = %unwinding.phase,
                    sequence = m.tx.sequence(),
                    target = %m.tx.target(),
                    error = %e,
                    "rollback target unavailable; restore skipped"
                );
                missed.insert(m.tx.sequence());
                report.missed_rollbacks.push(m.tx.sequence());
            }
        }
        m.tx.transition(TransactionStatus::RolledBack)?;
    }

    // Commit, in capture order.
    for m in members
        .iter_mut()
        .filter(|m| m.tx.status() == TransactionStatus::Valid)
    {
        match world.write_state(m.tx.target(), m.tx.proposed(), m.tx.flags()) {
            Ok(()) => {
                m.tx.transition(TransactionStatus::Committed)?;
                report.committed.push(m.tx.sequence());
            }
            Err(e) => {
                warn!(
                    phase = %unwinding.phase,
                    sequence = m.tx.sequence(),
                    target = %m.tx.target(),
                    error = %e,
                    "commit refused by world; transaction discarded"
                );
                m.tx.transition(TransactionStatus::Discarded)?;
            }
        }
    }

    for m in &members {
        let outcome = match m.tx.status() {
            TransactionStatus::RolledBack if missed.contains(&m.tx.sequence()) => {
                Outcome::RollbackMissed
            }
            status => match Outcome::from_status(status) {
                Some(outcome) => outcome,
                None => continue,
            },
        };
        if outcome != Outcome::Committed {
            release_reserved(world, &m.tx);
        }
        if outcome == Outcome::Discarded {
            report.discarded.push(m.tx.sequence());
        }
        unwinding.record(&m.tx, outcome, &m.cause);
    }

    debug!(
        phase = %unwinding.phase,
        committed = report.committed.len(),
        rolled_back = report.rolled_back.len(),
        discarded = report.discarded.len(),
        "unwind resolved"
    );
    Ok(())
}

/// Drop captured transactions without posting or writing them. A
/// transaction whose lifecycle no longer allows discarding is logged and
/// skipped.
pub(crate) fn discard(
    unwinding: &mut Unwinding<'_>,
    txs: Vec<Transaction>,
    world: &mut dyn WorldAccess,
    report: &mut UnwindReport,
) {
    let cause = unwinding.ambient.clone();
    for mut tx in txs {
        if let Err(e) = tx.transition(TransactionStatus::Discarded) {
            warn!(
                phase = %unwinding.phase,
                sequence = tx.sequence(),
                error = %e,
                "transaction cannot be discarded; dropped unjournaled"
            );
            continue;
        }
        release_reserved(world, &tx);
        report.discarded.push(tx.sequence());
        unwinding.record(&tx, Outcome::Discarded, &cause);
    }
}

/// Give back the entity id of a spawn or drop that never happened.
pub(crate) fn release_reserved(world: &mut dyn WorldAccess, tx: &Transaction) {
    let creates_entity = matches!(
        tx.kind(),
        TransactionKind::EntitySpawn | TransactionKind::ItemDrop
    );
    if tx.original_is_pending() {
        return;
    }
    if let (true, Target::Entity(id), State::Entity(None)) =
        (creates_entity, tx.target(), tx.original())
    {
        world.release_entity(*id);
    }
}
