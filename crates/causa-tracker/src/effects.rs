//! Standard mutation steps and pipelines.
//!
//! Each argument type ([`BlockChange`], [`Spawn`], [`ItemDrop`],
//! [`SlotChange`]) describes one kind of mutation through the [`Mutation`]
//! trait. The generic steps ([`SkipUnchanged`], [`CaptureChange`],
//! [`CommitProposed`]) work for all of them; [`DropsOnBreak`] is specific to
//! block changes.
//!
//! | Pipeline | Steps |
//! |----------|-------|
//! | [`block_change_pipeline`] | skip-unchanged, capture-change, drops-on-break, commit-proposed |
//! | [`entity_spawn_pipeline`] | capture-change, commit-proposed |
//! | [`item_drop_pipeline`] | capture-change, commit-proposed |
//! | [`interaction_pipeline`] | skip-unchanged, capture-change, commit-proposed |

use std::fmt;

use causa_world::access::WorldAccess;
use causa_world::entity::EntityId;
use causa_world::state::{
    BlockState, CellPos, ChangeFlags, EntitySnapshot, ItemStack, State, Target,
};
use causa_world::transaction::TransactionKind;
use tracing::trace;

use crate::pipeline::{
    EffectContext, EffectError, EffectResult, Pipeline, PipelineCursor, PipelineError, SideEffect,
};
use crate::tracker::{PhaseTracker, Proposal};

// ---------------------------------------------------------------------------
// Mutation arguments
// ---------------------------------------------------------------------------

/// Arguments describing one mutation of a fixed kind.
pub trait Mutation: Send + Sync {
    const KIND: TransactionKind;

    /// The state the mutation wants at its target.
    fn proposed(&self) -> State;

    fn flags(&self) -> ChangeFlags {
        ChangeFlags::DEFAULT
    }

    /// The target whose mutation caused this one.
    fn related(&self) -> Option<Target> {
        None
    }
}

/// Set a cell's block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChange {
    pub state: BlockState,
    pub flags: ChangeFlags,
}

impl BlockChange {
    pub fn new(state: BlockState) -> Self {
        Self {
            state,
            flags: ChangeFlags::DEFAULT,
        }
    }
}

impl Mutation for BlockChange {
    const KIND: TransactionKind = TransactionKind::CellChange;

    fn proposed(&self) -> State {
        State::Block(self.state.clone())
    }

    fn flags(&self) -> ChangeFlags {
        self.flags
    }
}

/// Bring an entity into the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawn {
    pub snapshot: EntitySnapshot,
    pub flags: ChangeFlags,
}

impl Spawn {
    pub fn new(snapshot: EntitySnapshot) -> Self {
        Self {
            snapshot,
            flags: ChangeFlags::DEFAULT,
        }
    }
}

impl Mutation for Spawn {
    const KIND: TransactionKind = TransactionKind::EntitySpawn;

    fn proposed(&self) -> State {
        State::Entity(Some(self.snapshot.clone()))
    }

    fn flags(&self) -> ChangeFlags {
        self.flags
    }
}

/// Drop an item stack into the world, optionally tied to the target that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDrop {
    pub stack: ItemStack,
    pub pos: CellPos,
    pub source: Option<Target>,
}

impl Mutation for ItemDrop {
    const KIND: TransactionKind = TransactionKind::ItemDrop;

    fn proposed(&self) -> State {
        State::Entity(Some(EntitySnapshot::dropped_item(
            self.stack.clone(),
            self.pos,
        )))
    }

    fn related(&self) -> Option<Target> {
        self.source
    }
}

/// Put a stack (or nothing) into an inventory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub stack: Option<ItemStack>,
}

impl Mutation for SlotChange {
    const KIND: TransactionKind = TransactionKind::InteractionResult;

    fn proposed(&self) -> State {
        State::Item(self.stack.clone())
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Finish immediately when the mutation would not change anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipUnchanged;

impl<A: Mutation> SideEffect<A> for SkipUnchanged {
    fn name(&self) -> &str {
        "skip-unchanged"
    }

    fn process(
        &self,
        _cx: &mut EffectContext<'_>,
        cursor: &mut PipelineCursor,
        args: &A,
    ) -> Result<EffectResult, EffectError> {
        if cursor.state == args.proposed() {
            return Ok(EffectResult::Done(cursor.state.clone()));
        }
        Ok(EffectResult::Pass)
    }
}

/// Capture the mutation in the current context, or write it straight
/// through when the current phase does not capture its kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureChange;

impl<A: Mutation> SideEffect<A> for CaptureChange {
    fn name(&self) -> &str {
        "capture-change"
    }

    fn process(
        &self,
        cx: &mut EffectContext<'_>,
        cursor: &mut PipelineCursor,
        args: &A,
    ) -> Result<EffectResult, EffectError> {
        let proposed = args.proposed();
        if cx.captures(A::KIND) {
            let sequence = cx.capture(
                Proposal::new(A::KIND, cursor.target, cursor.state.clone(), proposed.clone())
                    .maybe_related_to(args.related())
                    .with_flags(args.flags()),
            )?;
            cursor.captured = Some(sequence);
        } else {
            trace!(kind = %A::KIND, target = %cursor.target, "not captured; writing through");
            cx.world()
                .write_state(&cursor.target, &proposed, args.flags())?;
        }
        cursor.state = proposed;
        Ok(EffectResult::Pass)
    }
}

/// Return the proposed state. Always the last step.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitProposed;

impl<A: Mutation> SideEffect<A> for CommitProposed {
    fn name(&self) -> &str {
        "commit-proposed"
    }

    fn process(
        &self,
        _cx: &mut EffectContext<'_>,
        _cursor: &mut PipelineCursor,
        args: &A,
    ) -> Result<EffectResult, EffectError> {
        Ok(EffectResult::Done(args.proposed()))
    }
}

/// Which stacks a broken block drops.
pub type DropTable = Box<dyn Fn(&BlockState) -> Vec<ItemStack> + Send + Sync>;

/// When a cell becomes air, run the item-drop pipeline for every stack the
/// drop table yields for the broken block. Each drop is related to the
/// broken cell, so invalidating the break discards its drops.
pub struct DropsOnBreak {
    table: DropTable,
    drops: Pipeline<ItemDrop>,
}

impl DropsOnBreak {
    pub fn new(table: impl Fn(&BlockState) -> Vec<ItemStack> + Send + Sync + 'static) -> Self {
        Self {
            table: Box::new(table),
            drops: item_drop_pipeline(),
        }
    }
}

impl fmt::Debug for DropsOnBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DropsOnBreak")
            .field("drops", &self.drops)
            .finish_non_exhaustive()
    }
}

impl SideEffect<BlockChange> for DropsOnBreak {
    fn name(&self) -> &str {
        "drops-on-break"
    }

    fn process(
        &self,
        cx: &mut EffectContext<'_>,
        cursor: &mut PipelineCursor,
        args: &BlockChange,
    ) -> Result<EffectResult, EffectError> {
        let Target::Cell(pos) = cursor.target else {
            return Ok(EffectResult::Pass);
        };
        let broken = match cursor.initial.as_block() {
            Some(block) if !block.is_air() && args.state.is_air() => block.clone(),
            _ => return Ok(EffectResult::Pass),
        };
        for stack in (self.table)(&broken) {
            let (tracker, world) = cx.split();
            let id = world.reserve_entity();
            let drop = ItemDrop {
                stack,
                pos,
                source: Some(cursor.target),
            };
            let result = self.drops.process(
                tracker,
                &mut *world,
                Target::Entity(id),
                State::Entity(None),
                &drop,
                State::Entity(None),
            );
            if let Err(e) = result {
                world.release_entity(id);
                return Err(EffectError::Nested(Box::new(e)));
            }
        }
        Ok(EffectResult::Pass)
    }
}

// ---------------------------------------------------------------------------
// Standard pipelines
// ---------------------------------------------------------------------------

pub fn block_change_pipeline(
    drop_table: impl Fn(&BlockState) -> Vec<ItemStack> + Send + Sync + 'static,
) -> Pipeline<BlockChange> {
    Pipeline::builder("block-change")
        .step(SkipUnchanged)
        .step(CaptureChange)
        .step(DropsOnBreak::new(drop_table))
        .step(CommitProposed)
        .build()
}

pub fn entity_spawn_pipeline() -> Pipeline<Spawn> {
    Pipeline::builder("entity-spawn")
        .step(CaptureChange)
        .step(CommitProposed)
        .build()
}

pub fn item_drop_pipeline() -> Pipeline<ItemDrop> {
    Pipeline::builder("item-drop")
        .step(CaptureChange)
        .step(CommitProposed)
        .build()
}

pub fn interaction_pipeline() -> Pipeline<SlotChange> {
    Pipeline::builder("interaction")
        .step(SkipUnchanged)
        .step(CaptureChange)
        .step(CommitProposed)
        .build()
}

/// The four standard pipelines behind target-level helpers.
#[derive(Debug)]
pub struct StandardPipelines {
    pub blocks: Pipeline<BlockChange>,
    pub spawns: Pipeline<Spawn>,
    pub drops: Pipeline<ItemDrop>,
    pub interactions: Pipeline<SlotChange>,
}

impl StandardPipelines {
    pub fn new(drop_table: impl Fn(&BlockState) -> Vec<ItemStack> + Send + Sync + 'static) -> Self {
        Self {
            blocks: block_change_pipeline(drop_table),
            spawns: entity_spawn_pipeline(),
            drops: item_drop_pipeline(),
            interactions: interaction_pipeline(),
        }
    }

    fn read(
        pipeline: &str,
        tracker: &PhaseTracker,
        world: &dyn WorldAccess,
        target: &Target,
    ) -> Result<State, PipelineError> {
        tracker
            .read_state(world, target)
            .map_err(|e| PipelineError {
                pipeline: pipeline.to_owned(),
                step: "read-state".to_owned(),
                discarded: Vec::new(),
                source: e.into(),
            })
    }

    /// Set the block at `pos`; returns the block the simulation now sees.
    pub fn set_block(
        &self,
        tracker: &mut PhaseTracker,
        world: &mut dyn WorldAccess,
        pos: CellPos,
        state: BlockState,
    ) -> Result<BlockState, PipelineError> {
        let target = Target::Cell(pos);
        let initial = Self::read(self.blocks.name(), tracker, &*world, &target)?;
        let args = BlockChange::new(state);
        let out = self.blocks.process(
            tracker,
            world,
            target,
            initial.clone(),
            &args,
            initial,
        )?;
        Ok(out.as_block().cloned().unwrap_or(BlockState::AIR))
    }

    /// Spawn `snapshot` under a freshly reserved id.
    pub fn spawn_entity(
        &self,
        tracker: &mut PhaseTracker,
        world: &mut dyn WorldAccess,
        snapshot: EntitySnapshot,
    ) -> Result<EntityId, PipelineError> {
        let id = world.reserve_entity();
        let result = self.spawns.process(
            tracker,
            &mut *world,
            Target::Entity(id),
            State::Entity(None),
            &Spawn::new(snapshot),
            State::Entity(None),
        );
        match result {
            Ok(_) => Ok(id),
            Err(e) => {
                world.release_entity(id);
                Err(e)
            }
        }
    }

    /// Drop `stack` at `pos` under a freshly reserved id.
    pub fn drop_item(
        &self,
        tracker: &mut PhaseTracker,
        world: &mut dyn WorldAccess,
        stack: ItemStack,
        pos: CellPos,
        source: Option<Target>,
    ) -> Result<EntityId, PipelineError> {
        let id = world.reserve_entity();
        let result = self.drops.process(
            tracker,
            &mut *world,
            Target::Entity(id),
            State::Entity(None),
            &ItemDrop { stack, pos, source },
            State::Entity(None),
        );
        match result {
            Ok(_) => Ok(id),
            Err(e) => {
                world.release_entity(id);
                Err(e)
            }
        }
    }

    /// Put `stack` into `holder`'s `slot`.
    pub fn set_slot(
        &self,
        tracker: &mut PhaseTracker,
        world: &mut dyn WorldAccess,
        holder: EntityId,
        slot: u16,
        stack: Option<ItemStack>,
    ) -> Result<Option<ItemStack>, PipelineError> {
        let target = Target::Slot { holder, slot };
        let initial = Self::read(self.interactions.name(), tracker, &*world, &target)?;
        let out = self.interactions.process(
            tracker,
            world,
            target,
            initial.clone(),
            &SlotChange { stack },
            initial,
        )?;
        Ok(match out {
            State::Item(stack) => stack,
            _ => None,
        })
    }
}
