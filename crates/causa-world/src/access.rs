//! The world accessor: the single seam through which tracked mutations
//! become visible.
//!
//! The tracking engine never mutates world state on its own. Every commit and
//! every rollback goes through [`WorldAccess::write_state`], and every
//! "what is there now" question through [`WorldAccess::read_state`]. Hosts
//! implement this trait over their real storage; [`MemoryWorld`] is the
//! in-memory implementation used by tests and tools.
//!
//! [`MemoryWorld`]: crate::memory::MemoryWorld

use crate::entity::EntityId;
use crate::state::{ChangeFlags, State, Target};
use crate::WorldError;

/// Read and write access to world state by [`Target`].
pub trait WorldAccess {
    /// The state currently stored at `target`.
    ///
    /// Absent entities and empty slots are reported as `State::Entity(None)`
    /// and `State::Item(None)`, not as errors. Errors mean the target cannot
    /// be reached at all (e.g. its chunk is unloaded).
    fn read_state(&self, target: &Target) -> Result<State, WorldError>;

    /// Store `state` at `target`.
    fn write_state(
        &mut self,
        target: &Target,
        state: &State,
        flags: ChangeFlags,
    ) -> Result<(), WorldError>;

    /// Reserve an id for an entity that a spawn or drop transaction will
    /// create. The entity does not exist until the transaction commits.
    fn reserve_entity(&mut self) -> EntityId;

    /// Give back a reserved id whose entity was never created (its
    /// transaction was rolled back or discarded). Returns `false` if the id
    /// is unknown or the entity exists.
    fn release_entity(&mut self, id: EntityId) -> bool;
}

impl<W: WorldAccess + ?Sized> WorldAccess for &mut W {
    fn read_state(&self, target: &Target) -> Result<State, WorldError> {
        (**self).read_state(target)
    }

    fn write_state(
        &mut self,
        target: &Target,
        state: &State,
        flags: ChangeFlags,
    ) -> Result<(), WorldError> {
        (**self).write_state(target, state, flags)
    }

    fn reserve_entity(&mut self) -> EntityId {
        (**self).reserve_entity()
    }

    fn release_entity(&mut self, id: EntityId) -> bool {
        (**self).release_entity(id)
    }
}
