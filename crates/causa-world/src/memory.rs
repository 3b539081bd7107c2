//! In-memory world used by tests, tools, and benchmarks.
//!
//! [`MemoryWorld`] stores cells, entities, and inventory slots in ordered
//! maps so its contents serialize deterministically. Every successful
//! [`write_state`](WorldAccess::write_state) call is appended to a write log,
//! which is how tests observe the exact sequence of commits and restores the
//! tracker performed.
//!
//! Chunks (16x16 columns of cells) can be marked unloaded to simulate a
//! target disappearing mid-tick; reads and writes of cells in an unloaded
//! chunk fail with [`WorldError::Unloaded`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::access::WorldAccess;
use crate::entity::{EntityAllocator, EntityId};
use crate::state::{BlockState, CellPos, ChangeFlags, EntitySnapshot, ItemStack, State, Target};
use crate::WorldError;

// ---------------------------------------------------------------------------
// WriteRecord
// ---------------------------------------------------------------------------

/// One successful write, as observed by the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub target: Target,
    pub state: State,
    pub flags: ChangeFlags,
}

// ---------------------------------------------------------------------------
// MemoryWorld
// ---------------------------------------------------------------------------

/// A complete world held in memory.
#[derive(Debug, Default)]
pub struct MemoryWorld {
    cells: BTreeMap<CellPos, BlockState>,
    entities: BTreeMap<EntityId, EntitySnapshot>,
    slots: BTreeMap<(EntityId, u16), ItemStack>,
    unloaded: BTreeSet<(i32, i32)>,
    allocator: EntityAllocator,
    writes: Vec<WriteRecord>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    // -- direct setup (bypasses the write log) ------------------------------

    /// Place a block without recording a write. For scene setup only.
    pub fn set_block(&mut self, pos: CellPos, state: BlockState) {
        if state.is_air() {
            self.cells.remove(&pos);
        } else {
            self.cells.insert(pos, state);
        }
    }

    /// The block at `pos`; unset cells are air.
    pub fn block_at(&self, pos: CellPos) -> BlockState {
        self.cells.get(&pos).cloned().unwrap_or(BlockState::AIR)
    }

    /// Insert an entity with a freshly reserved id. For scene setup only.
    pub fn insert_entity(&mut self, snapshot: EntitySnapshot) -> EntityId {
        let id = self.allocator.reserve();
        self.entities.insert(id, snapshot);
        id
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Put an item stack into a holder's slot. For scene setup only.
    pub fn set_slot(&mut self, holder: EntityId, slot: u16, stack: Option<ItemStack>) {
        match stack {
            Some(stack) => {
                self.slots.insert((holder, slot), stack);
            }
            None => {
                self.slots.remove(&(holder, slot));
            }
        }
    }

    pub fn slot(&self, holder: EntityId, slot: u16) -> Option<&ItemStack> {
        self.slots.get(&(holder, slot))
    }

    /// Whether `id` is reserved or live (not stale).
    pub fn is_reserved(&self, id: EntityId) -> bool {
        self.allocator.is_reserved(id)
    }

    // -- chunk loading ------------------------------------------------------

    /// Mark the chunk containing `pos` as unloaded.
    pub fn unload_chunk(&mut self, pos: CellPos) {
        self.unloaded.insert(Self::chunk_of(pos));
    }

    /// Mark the chunk containing `pos` as loaded again.
    pub fn load_chunk(&mut self, pos: CellPos) {
        self.unloaded.remove(&Self::chunk_of(pos));
    }

    fn chunk_of(pos: CellPos) -> (i32, i32) {
        (pos.x >> 4, pos.z >> 4)
    }

    fn ensure_loaded(&self, pos: CellPos) -> Result<(), WorldError> {
        if self.unloaded.contains(&Self::chunk_of(pos)) {
            return Err(WorldError::Unloaded { pos });
        }
        Ok(())
    }

    // -- observation --------------------------------------------------------

    /// Every write performed through [`WorldAccess`], oldest first.
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    /// Forget the write log (world contents are untouched).
    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// BLAKE3 hex digest of the world contents (cells, entities, slots).
    ///
    /// Two worlds with identical contents have identical fingerprints,
    /// regardless of the history of writes that produced them.
    pub fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct Contents<'a> {
            cells: Vec<(&'a CellPos, &'a BlockState)>,
            entities: Vec<(&'a EntityId, &'a EntitySnapshot)>,
            slots: Vec<(&'a (EntityId, u16), &'a ItemStack)>,
        }

        let contents = Contents {
            cells: self.cells.iter().collect(),
            entities: self.entities.iter().collect(),
            slots: self.slots.iter().collect(),
        };
        let bytes = serde_json::to_vec(&contents)
            .expect("MemoryWorld contents should always be JSON-serializable");
        blake3::hash(&bytes).to_hex().to_string()
    }
}

impl WorldAccess for MemoryWorld {
    fn read_state(&self, target: &Target) -> Result<State, WorldError> {
        match *target {
            Target::Cell(pos) => {
                self.ensure_loaded(pos)?;
                Ok(State::Block(self.block_at(pos)))
            }
            Target::Entity(id) => Ok(State::Entity(self.entities.get(&id).cloned())),
            Target::Slot { holder, slot } => {
                if !self.entities.contains_key(&holder) {
                    return Err(WorldError::TargetMissing { target: *target });
                }
                Ok(State::Item(self.slots.get(&(holder, slot)).cloned()))
            }
        }
    }

    fn write_state(
        &mut self,
        target: &Target,
        state: &State,
        flags: ChangeFlags,
    ) -> Result<(), WorldError> {
        match (*target, state) {
            (Target::Cell(pos), State::Block(block)) => {
                self.ensure_loaded(pos)?;
                self.set_block(pos, block.clone());
            }
            (Target::Entity(id), State::Entity(snapshot)) => match snapshot {
                Some(snapshot) => {
                    self.entities.insert(id, snapshot.clone());
                }
                None => {
                    self.entities.remove(&id);
                }
            },
            (Target::Slot { holder, slot }, State::Item(stack)) => {
                if !self.entities.contains_key(&holder) {
                    return Err(WorldError::TargetMissing { target: *target });
                }
                self.set_slot(holder, slot, stack.clone());
            }
            _ => {
                return Err(WorldError::StateMismatch {
                    target: *target,
                    state: state.clone(),
                })
            }
        }
        self.writes.push(WriteRecord {
            target: *target,
            state: state.clone(),
            flags,
        });
        Ok(())
    }

    fn reserve_entity(&mut self) -> EntityId {
        self.allocator.reserve()
    }

    fn release_entity(&mut self, id: EntityId) -> bool {
        !self.entities.contains_key(&id) && self.allocator.release(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
