//! Entity identifiers and allocation.
//!
//! An [`EntityId`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. Spawn transactions need an
//! id before the entity exists in the world, so the host reserves one from an
//! [`EntityAllocator`] at capture time. If the spawn is rolled back the id is
//! released again and its generation bumped, which makes every outstanding
//! handle to the cancelled entity stale.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Construct an `EntityId` from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Reserves and releases [`EntityId`]s with generational tracking.
///
/// Released indices are recycled FIFO so that generations spread out over
/// time instead of piling up on one hot index.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    reserved: Vec<bool>,
    free_indices: VecDeque<u32>,
}

impl EntityAllocator {
    /// Create a new, empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh [`EntityId`].
    pub fn reserve(&mut self) -> EntityId {
        if let Some(index) = self.free_indices.pop_front() {
            self.reserved[index as usize] = true;
            EntityId::new(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.reserved.push(true);
            EntityId::new(index, 0)
        }
    }

    /// Release a reserved id so its index can be recycled.
    ///
    /// Returns `false` if the id was stale or never reserved.
    pub fn release(&mut self, id: EntityId) -> bool {
        if !self.is_reserved(id) {
            return false;
        }
        let idx = id.index() as usize;
        self.reserved[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_indices.push_back(id.index());
        true
    }

    /// Whether `id` is currently reserved (and not stale).
    pub fn is_reserved(&self, id: EntityId) -> bool {
        let idx = id.index() as usize;
        idx < self.generations.len()
            && self.reserved[idx]
            && self.generations[idx] == id.generation()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
