//! Verb instructions run by action nodes, rewards and stop hooks.

use serde::{Deserialize, Serialize};

use crate::types::{Location, QuestId};

/// One verb instruction. Tagged by `type` in content files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    /// Chat message (placeholders allowed).
    Message {
        /// Text.
        text: String,
    },
    /// Action-bar message.
    ActionBar {
        /// Text.
        text: String,
    },
    /// Play a sound at the player.
    Sound {
        /// Sound key.
        sound: String,
        /// Volume.
        #[serde(default = "default_unit")]
        volume: f64,
        /// Pitch.
        #[serde(default = "default_unit")]
        pitch: f64,
    },
    /// Show a title.
    Title {
        /// Title line.
        title: String,
        /// Subtitle line.
        #[serde(default)]
        subtitle: String,
        /// Fade-in ticks.
        #[serde(default = "default_fade_in")]
        fade_in: u32,
        /// Stay ticks.
        #[serde(default = "default_stay")]
        stay: u32,
        /// Fade-out ticks.
        #[serde(default = "default_fade_out")]
        fade_out: u32,
    },
    /// Give items.
    GiveItem(ItemStack),
    /// Take items.
    TakeItem(ItemStack),
    /// Rename / re-lore items the player holds.
    ModifyItem {
        /// Item name.
        item: String,
        /// New display name.
        #[serde(default)]
        rename: Option<String>,
        /// New lore lines.
        #[serde(default)]
        lore: Vec<String>,
    },
    /// Dispatch a command.
    Command {
        /// Command line (placeholders allowed).
        command: String,
        /// Who runs it.
        #[serde(default)]
        sender: CommandSender,
    },
    /// Teleport the player.
    Teleport {
        /// Destination.
        location: Location,
    },
    /// Start a timed effect.
    Effect {
        /// Effect script id.
        effect: String,
        /// Once or repeating.
        #[serde(default)]
        mode: EffectMode,
        /// Fixed anchor; the player's position when absent.
        #[serde(default)]
        at: Option<Location>,
    },
    /// Start a branch of this quest in parallel.
    StartBranch {
        /// Branch id.
        branch: String,
    },
    /// Stop the branch running these instructions.
    StopBranch,
    /// Start another quest.
    StartQuest {
        /// Quest id.
        quest: QuestId,
    },
    /// Stop a quest (this one when absent).
    StopQuest {
        /// Quest id.
        #[serde(default)]
        quest: Option<QuestId>,
    },
    /// Add ticks to the instruction delay accumulator.
    Wait {
        /// Ticks.
        ticks: u64,
    },
    /// Blocking confirmation prompt.
    Prompt {
        /// Prompt text.
        text: String,
        /// How the player confirms.
        #[serde(default)]
        mode: PromptMode,
    },
    /// Ask the navigation integration to guide the player.
    Navigate {
        /// Destination.
        destination: Location,
        /// Block the remaining instructions until arrival.
        #[serde(default)]
        wait: bool,
    },
    /// Modify a variable.
    Variable(VariableChange),
    /// Grant pool tokens.
    PoolToken {
        /// Pool id.
        pool: String,
        /// Tokens.
        #[serde(default = "default_one")]
        amount: u32,
    },
    /// Pay money through the economy integration.
    Money {
        /// Amount (negative withdraws).
        amount: f64,
    },
    /// A verb this build does not know. Skipped.
    #[serde(other)]
    Unknown,
}

impl Instruction {
    /// Whether the instruction suspends the remaining list until an external event.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::Prompt { .. } | Self::Navigate { wait: true, .. }
        )
    }
}

/// An item name with an amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    /// Item name.
    pub item: String,
    /// Amount.
    #[serde(default = "default_one")]
    pub amount: u32,
}

impl ItemStack {
    /// Create a stack.
    #[must_use]
    pub fn new(item: impl Into<String>, amount: u32) -> Self {
        Self {
            item: item.into(),
            amount,
        }
    }
}

/// Who dispatches a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSender {
    /// The server console.
    #[default]
    Console,
    /// The player, with their own permissions.
    Player,
    /// The player, with elevated permissions for this one command.
    Elevated,
}

/// Effect run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMode {
    /// Run once and finish.
    #[default]
    Once,
    /// Restart from the top when the script ends.
    Repeat,
}

/// How a prompt is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Clicking the prompt text.
    #[default]
    Click,
    /// Sneaking.
    Sneak,
}

/// Variable scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarScope {
    /// Per-quest variables in the player's progress.
    #[default]
    Quest,
    /// Per-player variables shared by every quest.
    User,
    /// Server-wide variables.
    Server,
}

/// Variable modification operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyOp {
    /// Store the evaluated formula.
    #[default]
    Set,
    /// Store the interpolated text as-is.
    SetText,
    /// Add the evaluated formula.
    Add,
    /// Subtract the evaluated formula.
    Subtract,
    /// Multiply by the evaluated formula.
    Multiply,
    /// Remove the variable.
    Delete,
}

/// A variable modification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableChange {
    /// Variable name.
    pub name: String,
    /// Scope.
    #[serde(default)]
    pub scope: VarScope,
    /// Operator.
    #[serde(default)]
    pub op: ModifyOp,
    /// Formula or text.
    #[serde(default)]
    pub value: String,
}

impl VariableChange {
    /// Shorthand for a quest-scoped change.
    #[must_use]
    pub fn quest(name: impl Into<String>, op: ModifyOp, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: VarScope::Quest,
            op,
            value: value.into(),
        }
    }
}

fn default_one() -> u32 { 1 }
fn default_unit() -> f64 { 1.0 }
fn default_fade_in() -> u32 { 10 }
fn default_stay() -> u32 { 70 }
fn default_fade_out() -> u32 { 20 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbs_with_defaults() {
        let list: Vec<Instruction> = serde_json::from_str(
            r#"[
                { "type": "message", "text": "hi {player}" },
                { "type": "wait", "ticks": 20 },
                { "type": "command", "command": "say hi", "sender": "elevated" },
                { "type": "variable", "name": "count", "op": "add", "value": "1" },
                { "type": "dance" }
            ]"#,
        )
        .expect("parse");
        assert_eq!(list.len(), 5);
        assert!(matches!(list[1], Instruction::Wait { ticks: 20 }));
        assert!(matches!(
            list[2],
            Instruction::Command { sender: CommandSender::Elevated, .. }
        ));
        assert!(matches!(
            list[3],
            Instruction::Variable(VariableChange { op: ModifyOp::Add, scope: VarScope::Quest, .. })
        ));
        assert!(matches!(list[4], Instruction::Unknown));
    }

    #[test]
    fn blocking_verbs() {
        let prompt = Instruction::Prompt { text: "ok?".into(), mode: PromptMode::Sneak };
        assert!(prompt.is_blocking());
        let nav = Instruction::Navigate { destination: Location::default(), wait: false };
        assert!(!nav.is_blocking());
    }
}
