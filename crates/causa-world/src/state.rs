//! World coordinates, targets, and state snapshots.
//!
//! A [`Target`] names *where* a mutation lands (a cell, an entity, an
//! inventory slot) and a [`State`] is an immutable snapshot of *what* lives
//! there. Transactions carry one target and two states (original and
//! proposed); the world accessor reads and writes states by target.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

// ---------------------------------------------------------------------------
// CellPos
// ---------------------------------------------------------------------------

/// Integer coordinate of one world cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The six face-adjacent neighbours, in a fixed order
    /// (down, up, north, south, west, east).
    pub fn neighbors(self) -> [CellPos; 6] {
        let CellPos { x, y, z } = self;
        [
            CellPos::new(x, y - 1, z),
            CellPos::new(x, y + 1, z),
            CellPos::new(x, y, z - 1),
            CellPos::new(x, y, z + 1),
            CellPos::new(x - 1, y, z),
            CellPos::new(x + 1, y, z),
        ]
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// BlockState
// ---------------------------------------------------------------------------

/// The state of one cell, identified by name (`"air"`, `"water"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockState(Cow<'static, str>);

impl BlockState {
    pub const AIR: BlockState = BlockState(Cow::Borrowed("air"));
    pub const STONE: BlockState = BlockState(Cow::Borrowed("stone"));
    pub const WATER: BlockState = BlockState(Cow::Borrowed("water"));

    /// A block state with a static name.
    pub const fn named(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// A block state with a runtime name.
    pub fn owned(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_air(&self) -> bool {
        self.0 == "air"
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ItemStack / EntitySnapshot
// ---------------------------------------------------------------------------

/// A stack of one item type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: String,
    pub count: u32,
}

impl ItemStack {
    pub fn new(item: impl Into<String>, count: u32) -> Self {
        Self {
            item: item.into(),
            count,
        }
    }
}

/// Everything needed to (re)create an entity.
///
/// Dropped items are entities of type `"item"` carrying an [`ItemStack`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub pos: CellPos,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub item: Option<ItemStack>,
}

impl EntitySnapshot {
    pub fn new(entity_type: impl Into<String>, pos: CellPos) -> Self {
        Self {
            entity_type: entity_type.into(),
            pos,
            item: None,
        }
    }

    /// Snapshot of a dropped item lying at `pos`.
    pub fn dropped_item(stack: ItemStack, pos: CellPos) -> Self {
        Self {
            entity_type: "item".to_owned(),
            pos,
            item: Some(stack),
        }
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// The identity a mutation is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Target {
    /// A world cell.
    Cell(CellPos),
    /// An entity, including dropped items.
    Entity(EntityId),
    /// One inventory slot of a holder entity.
    Slot { holder: EntityId, slot: u16 },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Cell(pos) => write!(f, "cell{pos}"),
            Target::Entity(id) => write!(f, "entity {id}"),
            Target::Slot { holder, slot } => write!(f, "slot {slot} of {holder}"),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A snapshot of what lives at a [`Target`]. `None` payloads mean "absent".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Block(BlockState),
    Entity(Option<EntitySnapshot>),
    Item(Option<ItemStack>),
}

impl State {
    /// Whether this state is shaped for `target` (blocks live in cells,
    /// entities in entity targets, items in slots).
    pub fn fits(&self, target: &Target) -> bool {
        matches!(
            (self, target),
            (State::Block(_), Target::Cell(_))
                | (State::Entity(_), Target::Entity(_))
                | (State::Item(_), Target::Slot { .. })
        )
    }

    pub fn as_block(&self) -> Option<&BlockState> {
        match self {
            State::Block(b) => Some(b),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeFlags
// ---------------------------------------------------------------------------

/// How a write should propagate inside the host simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFlags {
    pub notify_neighbors: bool,
    pub update_clients: bool,
    pub physics: bool,
}

impl ChangeFlags {
    /// Normal gameplay writes.
    pub const DEFAULT: ChangeFlags = ChangeFlags {
        notify_neighbors: true,
        update_clients: true,
        physics: true,
    };

    /// Rollback writes: clients must see the restored state, but nothing may
    /// react to it.
    pub const RESTORE: ChangeFlags = ChangeFlags {
        notify_neighbors: false,
        update_clients: true,
        physics: false,
    };
}

impl Default for ChangeFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}
