//! Stateless action primitives.
//!
//! Each function performs one effect through the [`Host`] or computes one
//! state change. None of them know about sessions or scheduling; the
//! interpreter decides when they run.

use tracing::debug;

use crate::definition::{CommandSender, ItemStack, ModifyOp};
use crate::expr::format_number;
use crate::host::{Host, TitleView};
use crate::types::{Location, PlayerId};

/// Send a chat message, one host call per line.
pub fn send_message(host: &mut dyn Host, player: PlayerId, text: &str) {
    for line in text.lines() {
        host.send_message(player, line);
    }
}

/// Show a title with the given timings.
pub fn show_title(
    host: &mut dyn Host,
    player: PlayerId,
    title: &str,
    subtitle: &str,
    (fade_in, stay, fade_out): (u32, u32, u32),
) {
    host.show_title(
        player,
        &TitleView {
            title: title.to_string(),
            subtitle: subtitle.to_string(),
            fade_in,
            stay,
            fade_out,
        },
    );
}

/// Give items. Returns the amount the host reported as given.
pub fn give_item(host: &mut dyn Host, player: PlayerId, stack: &ItemStack) -> u32 {
    let given = host.give_item(player, &stack.item, stack.amount);
    if given < stack.amount {
        debug!(%player, item = %stack.item, wanted = stack.amount, given, "Inventory could not hold every item");
    }
    given
}

/// Take items only when the player holds enough. Returns whether they were taken.
pub fn take_item(host: &mut dyn Host, player: PlayerId, stack: &ItemStack) -> bool {
    if host.count_item(player, &stack.item) < stack.amount {
        return false;
    }
    host.take_item(player, &stack.item, stack.amount) >= stack.amount
}

/// Whether the player holds every stack.
#[must_use]
pub fn has_items(host: &dyn Host, player: PlayerId, stacks: &[ItemStack]) -> bool {
    stacks
        .iter()
        .all(|s| host.count_item(player, &s.item) >= s.amount)
}

/// Dispatch a command line (a leading `/` is stripped).
pub fn dispatch_command(host: &mut dyn Host, player: PlayerId, command: &str, sender: CommandSender) {
    let command = command.trim().trim_start_matches('/');
    if command.is_empty() {
        return;
    }
    host.run_command(player, command, sender);
}

/// Teleport, falling back to the player's current world when the
/// destination names none.
pub fn teleport(host: &mut dyn Host, player: PlayerId, to: &Location) {
    if to.world.is_empty() {
        if let Some(here) = host.location_of(player) {
            let mut target = to.clone();
            target.world = here.world;
            host.teleport(player, &target);
            return;
        }
    }
    host.teleport(player, to);
}

/// Compute a variable's new value. `None` means the variable is removed.
///
/// `operand` is the evaluated formula; `text` the interpolated raw value
/// (used by [`ModifyOp::SetText`]). Arithmetic on a non-numeric current
/// value treats it as `0`.
#[must_use]
pub fn modify_value(current: Option<&str>, op: ModifyOp, operand: f64, text: &str) -> Option<String> {
    let base = || current.and_then(|c| c.trim().parse::<f64>().ok()).unwrap_or(0.0);
    match op {
        ModifyOp::Set => Some(format_number(operand)),
        ModifyOp::SetText => Some(text.to_string()),
        ModifyOp::Add => Some(format_number(base() + operand)),
        ModifyOp::Subtract => Some(format_number(base() - operand)),
        ModifyOp::Multiply => Some(format_number(base() * operand)),
        ModifyOp::Delete => None,
    }
}

/// Whether `command` starts with any blocked prefix (case-insensitive,
/// leading `/` ignored, whole first words only).
#[must_use]
pub fn command_blocked(command: &str, blocked: &[String]) -> bool {
    let command = command.trim().trim_start_matches('/').to_ascii_lowercase();
    blocked.iter().any(|prefix| {
        let prefix = prefix.trim().trim_start_matches('/').to_ascii_lowercase();
        !prefix.is_empty()
            && command.starts_with(&prefix)
            && command[prefix.len()..]
                .chars()
                .next()
                .is_none_or(char::is_whitespace)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Inventory {
        items: HashMap<String, u32>,
        commands: Vec<(String, CommandSender)>,
        teleports: Vec<Location>,
    }

    impl Host for Inventory {
        fn location_of(&self, _player: PlayerId) -> Option<Location> {
            Some(Location::new("nether", 0.0, 0.0, 0.0))
        }
        fn give_item(&mut self, _p: PlayerId, item: &str, amount: u32) -> u32 {
            *self.items.entry(item.to_string()).or_insert(0) += amount;
            amount
        }
        fn take_item(&mut self, _p: PlayerId, item: &str, amount: u32) -> u32 {
            let have = self.items.entry(item.to_string()).or_insert(0);
            let taken = amount.min(*have);
            *have -= taken;
            taken
        }
        fn count_item(&self, _p: PlayerId, item: &str) -> u32 {
            self.items.get(item).copied().unwrap_or(0)
        }
        fn run_command(&mut self, _p: PlayerId, command: &str, sender: CommandSender) {
            self.commands.push((command.to_string(), sender));
        }
        fn teleport(&mut self, _p: PlayerId, to: &Location) {
            self.teleports.push(to.clone());
        }
    }

    #[test]
    fn take_requires_the_full_amount() {
        let mut inv = Inventory::default();
        let p = PlayerId::new();
        give_item(&mut inv, p, &ItemStack::new("bread", 2));
        assert!(!take_item(&mut inv, p, &ItemStack::new("bread", 3)));
        assert_eq!(inv.count_item(p, "bread"), 2, "nothing taken on failure");
        assert!(take_item(&mut inv, p, &ItemStack::new("bread", 2)));
        assert!(!has_items(&inv, p, &[ItemStack::new("bread", 1)]));
    }

    #[test]
    fn commands_strip_slash_and_keep_sender() {
        let mut inv = Inventory::default();
        dispatch_command(&mut inv, PlayerId::new(), "/say hi", CommandSender::Elevated);
        dispatch_command(&mut inv, PlayerId::new(), "  ", CommandSender::Console);
        assert_eq!(inv.commands, vec![("say hi".to_string(), CommandSender::Elevated)]);
    }

    #[test]
    fn teleport_without_world_uses_current_world() {
        let mut inv = Inventory::default();
        teleport(&mut inv, PlayerId::new(), &Location::new("", 1.0, 2.0, 3.0));
        assert_eq!(inv.teleports[0].world, "nether");
    }

    #[test]
    fn modify_value_ops() {
        assert_eq!(modify_value(Some("4"), ModifyOp::Add, 1.0, ""), Some("5".into()));
        assert_eq!(modify_value(Some("knight"), ModifyOp::Add, 2.0, ""), Some("2".into()));
        assert_eq!(modify_value(None, ModifyOp::Multiply, 3.0, ""), Some("0".into()));
        assert_eq!(modify_value(Some("1"), ModifyOp::SetText, 0.0, "mage"), Some("mage".into()));
        assert_eq!(modify_value(Some("1"), ModifyOp::Set, 2.5, ""), Some("2.5".into()));
        assert_eq!(modify_value(Some("1"), ModifyOp::Delete, 0.0, ""), None);
    }

    #[test]
    fn blocked_commands_match_whole_words() {
        let blocked = vec!["spawn".to_string(), "/home set".to_string()];
        assert!(command_blocked("/spawn", &blocked));
        assert!(command_blocked("SPAWN now", &blocked));
        assert!(!command_blocked("spawnpoint", &blocked));
        assert!(command_blocked("home set base", &blocked));
        assert!(!command_blocked("home", &blocked));
    }
}
