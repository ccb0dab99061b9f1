//! Live, transient per-(player, quest) interpreter state.
//!
//! Positions live in the persisted [`crate::state::QuestProgress`]; a
//! session only holds what may be lost on restart: continuation tokens,
//! open menus, choice overrides and the per-tick step budget.

use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::{PromptMode, QuestDefinition};
use crate::host::MenuStyle;
use crate::types::{PlayerId, QuestId, Tick};

/// A suspended continuation, keyed by a single-use token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    /// An open choice menu.
    Menu(OpenMenu),
    /// A prompt waiting for a click or sneak.
    Prompt {
        /// Branch running the instruction list.
        branch: String,
        /// Node holding the list.
        node: String,
        /// Instruction to resume at.
        resume: usize,
        /// Confirmation gesture.
        mode: PromptMode,
    },
    /// Blocking external navigation.
    Navigation {
        /// Branch running the instruction list.
        branch: String,
        /// Node holding the list.
        node: String,
        /// Instruction to resume at.
        resume: usize,
    },
}

impl Pending {
    /// Branch the continuation belongs to.
    #[must_use]
    pub fn branch(&self) -> &str {
        match self {
            Self::Menu(menu) => &menu.branch,
            Self::Prompt { branch, .. } | Self::Navigation { branch, .. } => branch,
        }
    }
}

/// Runtime state of an open menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMenu {
    /// Branch the menu node is in.
    pub branch: String,
    /// Menu node id.
    pub node: String,
    /// Dialog or GUI.
    pub style: MenuStyle,
    /// Indices of visible choices, in display order.
    pub visible: Vec<usize>,
    /// Current page.
    pub page: usize,
}

/// One running quest of one online player.
#[derive(Debug)]
pub struct Session {
    /// Owner.
    pub player: PlayerId,
    /// Quest.
    pub quest: QuestId,
    /// Definition snapshot the session was started with.
    pub definition: Arc<QuestDefinition>,
    /// Suspended continuations by token.
    pub pending: HashMap<u64, Pending>,
    /// Choice-by-reference overrides: branch -> goto of the chosen entry.
    pub choice_overrides: HashMap<String, String>,
    /// Lines mirrored from dialog menus, oldest first.
    pub dialog_history: Vec<String>,
    /// Set once the quest ended or was stopped.
    pub ended: bool,
    step_tick: Tick,
    steps: u32,
}

impl Session {
    /// New session for a definition.
    #[must_use]
    pub fn new(player: PlayerId, definition: Arc<QuestDefinition>) -> Self {
        Self {
            player,
            quest: definition.id.clone(),
            definition,
            pending: HashMap::new(),
            choice_overrides: HashMap::new(),
            dialog_history: Vec::new(),
            ended: false,
            step_tick: 0,
            steps: 0,
        }
    }

    /// Consume one node execution from the per-tick budget.
    pub fn take_step(&mut self, now: Tick, max_steps: u32) -> bool {
        if self.step_tick != now {
            self.step_tick = now;
            self.steps = 0;
        }
        if self.steps >= max_steps {
            return false;
        }
        self.steps += 1;
        true
    }

    /// Remove every continuation of a branch, returning the tokens dropped.
    pub fn clear_branch(&mut self, branch: &str) -> Vec<u64> {
        let tokens: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.branch() == branch)
            .map(|(t, _)| *t)
            .collect();
        for t in &tokens {
            self.pending.remove(t);
        }
        self.choice_overrides.remove(branch);
        tokens
    }

    /// Whether a menu is open.
    #[must_use]
    pub fn has_menu(&self) -> bool {
        self.pending.values().any(|p| matches!(p, Pending::Menu(_)))
    }

    /// Whether a navigation wait is pending.
    #[must_use]
    pub fn has_navigation(&self) -> bool {
        self.pending.values().any(|p| matches!(p, Pending::Navigation { .. }))
    }

    /// Append a line to the dialog history unless it is already the newest entry.
    pub fn mirror_dialog(&mut self, line: &str) {
        if self.dialog_history.last().map(String::as_str) != Some(line) {
            self.dialog_history.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_budget_resets_each_tick() {
        let mut s = Session::new(PlayerId::new(), Arc::new(QuestDefinition::new("q")));
        assert!(s.take_step(1, 2));
        assert!(s.take_step(1, 2));
        assert!(!s.take_step(1, 2));
        assert!(s.take_step(2, 2));
    }

    #[test]
    fn clear_branch_only_drops_that_branch() {
        let mut s = Session::new(PlayerId::new(), Arc::new(QuestDefinition::new("q")));
        s.pending.insert(
            1,
            Pending::Navigation { branch: "main".into(), node: "a".into(), resume: 1 },
        );
        s.pending.insert(
            2,
            Pending::Navigation { branch: "side".into(), node: "b".into(), resume: 0 },
        );
        assert_eq!(s.clear_branch("main"), vec![1]);
        assert_eq!(s.pending.len(), 1);
    }

    #[test]
    fn dialog_mirror_skips_repeats() {
        let mut s = Session::new(PlayerId::new(), Arc::new(QuestDefinition::new("q")));
        s.mirror_dialog("Guard: halt");
        s.mirror_dialog("Guard: halt");
        s.mirror_dialog("Guard: who goes");
        assert_eq!(s.dialog_history.len(), 2);
    }
}
