//! Integration hooks for the game server's raw events.
//!
//! These turn what the server's listeners see (raw ids, command lines,
//! position updates) into [`WorldEvent`]s the engine understands.

use std::collections::HashMap;

use uuid::Uuid;

use questline_core::definition::InteractKind;
use questline_core::types::Location;
use questline_core::{PlayerId, WorldEvent};

/// Parse a player id as the server reports it.
#[must_use]
pub fn parse_player(raw: &str) -> Option<PlayerId> {
    Uuid::parse_str(raw.trim()).ok().map(PlayerId)
}

/// Create a chat event.
#[must_use]
pub fn on_chat(message: &str) -> WorldEvent {
    WorldEvent::Chat {
        message: message.to_string(),
    }
}

/// Create a command event from a raw command line.
#[must_use]
pub fn on_command(line: &str) -> WorldEvent {
    WorldEvent::Command {
        command: line.trim().trim_start_matches('/').to_string(),
    }
}

/// Create an interaction event.
#[must_use]
pub fn on_interact(target: &str, kind: InteractKind) -> WorldEvent {
    WorldEvent::Interact {
        target: target.to_string(),
        kind,
    }
}

/// Create a kill event.
#[must_use]
pub fn on_kill(entity: &str) -> WorldEvent {
    WorldEvent::EntityKill {
        entity: entity.to_string(),
    }
}

/// Create a pickup event.
#[must_use]
pub fn on_pickup(item: &str, amount: u32) -> WorldEvent {
    WorldEvent::ItemPickup {
        item: item.to_string(),
        amount,
    }
}

// ---------------------------------------------------------------------------
// Movement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockPos {
    world: String,
    x: i64,
    y: i64,
    z: i64,
}

impl BlockPos {
    #[allow(clippy::cast_possible_truncation)]
    fn of(at: &Location) -> Self {
        Self {
            world: at.world.clone(),
            x: at.x.floor() as i64,
            y: at.y.floor() as i64,
            z: at.z.floor() as i64,
        }
    }
}

/// Collapses position updates into one move event per block crossed.
///
/// Servers report movement many times per second, mostly for head
/// rotation. Only a change of block (or world) reaches the engine; the
/// event spans from the last reported block to the new position.
#[derive(Debug, Default)]
pub struct MoveFilter {
    last: HashMap<PlayerId, (BlockPos, Location)>,
}

impl MoveFilter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a position update; returns a move event when a block boundary
    /// was crossed. The first update for a player only records it.
    pub fn update(&mut self, player: PlayerId, to: &Location) -> Option<WorldEvent> {
        let block = BlockPos::of(to);
        match self.last.get_mut(&player) {
            None => {
                self.last.insert(player, (block, to.clone()));
                None
            }
            Some((last_block, _)) if *last_block == block => None,
            Some(entry) => {
                let from = std::mem::replace(entry, (block, to.clone())).1;
                Some(WorldEvent::Move { from, to: to.clone() })
            }
        }
    }

    /// Drop a player's last position (disconnect, teleport).
    pub fn forget(&mut self, player: PlayerId) {
        self.last.remove(&player);
    }

    /// Players being tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// True when nobody is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_ids_parse_with_or_without_whitespace() {
        let id = Uuid::new_v4();
        assert_eq!(parse_player(&format!(" {id} ")), Some(PlayerId(id)));
        assert_eq!(parse_player("steve"), None);
    }

    #[test]
    fn commands_lose_their_slash() {
        assert_eq!(
            on_command("/spawn home"),
            WorldEvent::Command {
                command: "spawn home".into()
            }
        );
    }

    #[test]
    fn moves_report_only_block_changes() {
        let mut filter = MoveFilter::new();
        let player = PlayerId::new();
        assert!(filter.update(player, &Location::new("world", 0.2, 64.0, 0.2)).is_none());
        assert!(filter.update(player, &Location::new("world", 0.9, 64.0, 0.5)).is_none());

        let event = filter.update(player, &Location::new("world", 1.1, 64.0, 0.5));
        match event {
            Some(WorldEvent::Move { from, to }) => {
                assert!((from.x - 0.2).abs() < f64::EPSILON);
                assert!((to.x - 1.1).abs() < f64::EPSILON);
            }
            other => panic!("expected a move, got {other:?}"),
        }

        assert!(filter.update(player, &Location::new("nether", 1.1, 64.0, 0.5)).is_some());
        filter.forget(player);
        assert!(filter.is_empty());
    }
}
