//! Built-in phases.

use causa_world::transaction::TransactionKind;

use crate::context::PhaseContext;
use crate::event::{DomainEvent, EventType};
use crate::phase::Phase;
use crate::synthesis;

/// The root phase. Always at the bottom of the stack, never unwound, and
/// captures nothing: mutations made while idle reach the world immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdlePhase;

impl IdlePhase {
    pub const NAME: &'static str = "idle";
}

impl Phase for IdlePhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn captures(&self, _kind: TransactionKind) -> bool {
        false
    }
}

/// A scheduled block update.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockTickPhase;

impl BlockTickPhase {
    pub const NAME: &'static str = "block-tick";
}

impl Phase for BlockTickPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// One entity's tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityTickPhase;

impl EntityTickPhase {
    pub const NAME: &'static str = "entity-tick";
}

impl Phase for EntityTickPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// Handling of one inbound client packet.
///
/// Packets are handled one at a time and never start a plugin change.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketPhase;

impl PacketPhase {
    pub const NAME: &'static str = "packet-handling";
}

impl Phase for PacketPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_switch_to(&self, next: &dyn Phase) -> bool {
        !matches!(next.name(), PacketPhase::NAME | PluginPhase::NAME)
    }
}

/// A plugin mutating the world outside of any tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginPhase;

impl PluginPhase {
    pub const NAME: &'static str = "plugin-change";
}

impl Phase for PluginPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_switch_to(&self, next: &dyn Phase) -> bool {
        next.name() != PluginPhase::NAME
    }
}

/// An explosion: every destroyed cell goes out in a single `Explode` event
/// so listeners can veto individual cells of one blast.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplosionPhase;

impl ExplosionPhase {
    pub const NAME: &'static str = "explosion";
}

impl Phase for ExplosionPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn captures(&self, kind: TransactionKind) -> bool {
        match kind {
            TransactionKind::CellChange
            | TransactionKind::ItemDrop
            | TransactionKind::EntitySpawn => true,
            TransactionKind::InteractionResult => false,
        }
    }

    fn can_switch_to(&self, next: &dyn Phase) -> bool {
        next.name() != ExplosionPhase::NAME
    }

    fn unwind(&self, ctx: &mut PhaseContext) -> anyhow::Result<Vec<DomainEvent>> {
        let cells = ctx.buffers_mut().drain(TransactionKind::CellChange);
        let mut events = Vec::new();
        if !cells.is_empty() {
            events.push(DomainEvent::new(EventType::Explode, cells));
        }
        events.extend(synthesis::standard_events(ctx));
        Ok(events)
    }
}
