//! World events fed into the engine by host hooks.

use serde::{Deserialize, Serialize};

use crate::definition::InteractKind;
use crate::types::Location;

/// Something a player did in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorldEvent {
    /// Player moved.
    Move {
        /// Previous location.
        from: Location,
        /// New location.
        to: Location,
    },
    /// Picked up items.
    ItemPickup {
        /// Item name.
        item: String,
        /// Amount.
        amount: u32,
    },
    /// Consumed an item.
    ItemConsume {
        /// Item name.
        item: String,
    },
    /// Crafted items.
    ItemCraft {
        /// Item name.
        item: String,
        /// Amount.
        amount: u32,
    },
    /// Traded for items.
    ItemTrade {
        /// Item name.
        item: String,
        /// Amount.
        amount: u32,
    },
    /// Broke a block.
    BlockBreak {
        /// Block type.
        block: String,
    },
    /// Placed a block.
    BlockPlace {
        /// Block type.
        block: String,
    },
    /// Interacted with a block.
    BlockInteract {
        /// Block type.
        block: String,
    },
    /// Killed an entity.
    EntityKill {
        /// Entity type.
        entity: String,
    },
    /// Damaged an entity.
    EntityDamage {
        /// Entity type.
        entity: String,
        /// Damage dealt.
        damage: f64,
    },
    /// Tamed an entity.
    EntityTame {
        /// Entity type.
        entity: String,
    },
    /// Chat line.
    Chat {
        /// Message.
        message: String,
    },
    /// Command line (without leading slash).
    Command {
        /// Command.
        command: String,
    },
    /// Started sneaking.
    Sneak,
    /// Interacted with a target (NPC, block, entity id).
    Interact {
        /// Target id.
        target: String,
        /// Interaction kind.
        kind: InteractKind,
    },
}

impl WorldEvent {
    /// Short name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::ItemPickup { .. } => "item_pickup",
            Self::ItemConsume { .. } => "item_consume",
            Self::ItemCraft { .. } => "item_craft",
            Self::ItemTrade { .. } => "item_trade",
            Self::BlockBreak { .. } => "block_break",
            Self::BlockPlace { .. } => "block_place",
            Self::BlockInteract { .. } => "block_interact",
            Self::EntityKill { .. } => "entity_kill",
            Self::EntityDamage { .. } => "entity_damage",
            Self::EntityTame { .. } => "entity_tame",
            Self::Chat { .. } => "chat",
            Self::Command { .. } => "command",
            Self::Sneak => "sneak",
            Self::Interact { .. } => "interact",
        }
    }
}
