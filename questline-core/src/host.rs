//! Host capability boundary.
//!
//! The engine never touches game objects. Everything it needs from the
//! server (messages, items, permissions, commands, menus) goes through the
//! [`Host`] trait, and optional integrations (effects, navigation,
//! economy) are separate traits that may simply be absent.
//!
//! All `Host` methods have inert defaults so embedders and tests implement
//! only what they use.

use crate::definition::{CommandSender, EffectMode};
use crate::types::{Location, PlayerId, QuestId};

/// Game server capabilities.
pub trait Host {
    /// Display name of a player.
    fn player_name(&self, _player: PlayerId) -> Option<String> {
        None
    }

    /// Current location of a player (`None` when offline or unknown).
    fn location_of(&self, _player: PlayerId) -> Option<Location> {
        None
    }

    /// Whether a player holds a permission node.
    fn has_permission(&self, _player: PlayerId, _permission: &str) -> bool {
        true
    }

    /// Send a chat message.
    fn send_message(&mut self, _player: PlayerId, _text: &str) {}

    /// Send an action-bar message.
    fn send_action_bar(&mut self, _player: PlayerId, _text: &str) {}

    /// Play a sound at the player.
    fn play_sound(&mut self, _player: PlayerId, _sound: &str, _volume: f64, _pitch: f64) {}

    /// Show a title.
    fn show_title(&mut self, _player: PlayerId, _title: &TitleView) {}

    /// Give items; returns how many were actually given.
    fn give_item(&mut self, _player: PlayerId, _item: &str, amount: u32) -> u32 {
        amount
    }

    /// Take items; returns how many were actually taken.
    fn take_item(&mut self, _player: PlayerId, _item: &str, _amount: u32) -> u32 {
        0
    }

    /// Count items in the player's inventory.
    fn count_item(&self, _player: PlayerId, _item: &str) -> u32 {
        0
    }

    /// Rename or re-lore items the player holds.
    fn modify_item(&mut self, _player: PlayerId, _item: &str, _rename: Option<&str>, _lore: &[String]) {}

    /// Dispatch a command line.
    fn run_command(&mut self, _player: PlayerId, _command: &str, _sender: CommandSender) {}

    /// Teleport a player.
    fn teleport(&mut self, _player: PlayerId, _to: &Location) {}

    /// Open or re-render a menu.
    fn show_menu(&mut self, _player: PlayerId, _menu: &MenuView) {}

    /// Close any open menu.
    fn close_menu(&mut self, _player: PlayerId) {}

    /// Show a prompt; the player's confirmation comes back with `token`.
    fn send_prompt(&mut self, _player: PlayerId, _text: &str, _token: u64) {}

    /// Draw one particle (effect VM output).
    fn display_particle(&mut self, _player: PlayerId, _particle: &str, _at: &Location, _count: u32) {}
}

/// A title to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleView {
    /// Title line.
    pub title: String,
    /// Subtitle line.
    pub subtitle: String,
    /// Fade-in ticks.
    pub fade_in: u32,
    /// Stay ticks.
    pub stay: u32,
    /// Fade-out ticks.
    pub fade_out: u32,
}

/// A rendered menu page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuView {
    /// Menu kind.
    pub style: MenuStyle,
    /// Speaker name.
    pub speaker: Option<String>,
    /// Body text (interpolated).
    pub text: String,
    /// Visible entries on this page.
    pub entries: Vec<MenuEntry>,
    /// Zero-based page.
    pub page: usize,
    /// Total pages.
    pub pages: usize,
    /// Earlier lines of this conversation, oldest first.
    pub history: Vec<String>,
}

/// Menu presentation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuStyle {
    /// Chat-style dialog.
    Dialog,
    /// Inventory-style GUI.
    Gui,
}

/// One visible menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    /// Label (interpolated).
    pub text: String,
    /// Opaque token to return through `handle_choice`.
    pub token: u64,
    /// Index of the choice in the menu definition.
    pub index: usize,
}

// ---------------------------------------------------------------------------
// Optional integrations
// ---------------------------------------------------------------------------

/// A request to start an effect run.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRequest {
    /// Player the effect is shown to.
    pub player: PlayerId,
    /// Quest that started it.
    pub quest: QuestId,
    /// Effect script id.
    pub effect: String,
    /// Once or repeating.
    pub mode: EffectMode,
    /// Fixed anchor; follows the player when `None`.
    pub anchor: Option<Location>,
}

/// Timed cosmetic effects, ticked by the engine.
pub trait EffectRunner {
    /// Start a run; returns false when refused (unknown script, run limit).
    fn start(&mut self, request: EffectRequest) -> bool;
    /// Cancel every run of a player.
    fn cancel_player(&mut self, player: PlayerId);
    /// Cancel every run a quest started for a player.
    fn cancel_quest(&mut self, player: PlayerId, quest: &QuestId);
    /// Advance all runs by one tick.
    fn tick(&mut self, host: &mut dyn Host);
    /// Number of live runs.
    fn active_runs(&self) -> usize;
}

/// External navigation (path guidance) integration.
pub trait Navigator {
    /// Begin guiding `player` to `destination`. Arrival is reported with
    /// `token` through the engine. Returns false when navigation is impossible.
    fn navigate(&mut self, player: PlayerId, destination: &Location, token: u64) -> bool;
    /// Abort guidance for a player.
    fn cancel(&mut self, player: PlayerId);
}

/// Economy integration.
pub trait Economy {
    /// Deposit (or withdraw when negative); returns false on failure.
    fn deposit(&mut self, player: PlayerId, amount: f64) -> bool;
}

/// Optional integrations. Absent ones make the matching instructions no-ops.
#[derive(Default)]
pub struct Capabilities {
    /// Effect runner.
    pub effects: Option<Box<dyn EffectRunner>>,
    /// Navigation.
    pub navigator: Option<Box<dyn Navigator>>,
    /// Economy.
    pub economy: Option<Box<dyn Economy>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("effects", &self.effects.is_some())
            .field("navigator", &self.navigator.is_some())
            .field("economy", &self.economy.is_some())
            .finish()
    }
}

/// A host that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

impl Host for NullHost {}
