//! Quest definitions: immutable, shared content.
//!
//! A [`QuestDefinition`] holds named [`Branch`]es, each a map from node id to
//! [`Node`]. Node behaviour is a closed tagged union ([`NodeKind`]) so that
//! adding a kind is a compile-time-checked change to the interpreter's
//! dispatch. Tags the engine does not know deserialize to
//! [`NodeKind::Unknown`] and run as a no-op.

pub mod action;
pub mod condition;
pub mod registry;

pub use action::{
    CommandSender, EffectMode, Instruction, ItemStack, ModifyOp, PromptMode, VarScope,
    VariableChange,
};
pub use condition::{CompareOp, Condition, ConditionCase, ConditionGroup, LogicCase};
pub use registry::{DefinitionRegistry, DefinitionSet, LoadReport};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Location, NodeRef, QuestId};

// ---------------------------------------------------------------------------
// Quest / Branch / Node
// ---------------------------------------------------------------------------

/// A complete quest script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestDefinition {
    /// Unique quest id.
    pub id: QuestId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Display description.
    #[serde(default)]
    pub description: String,
    /// Branch the quest starts in; the configured default when absent.
    #[serde(default)]
    pub start_branch: Option<String>,
    /// Named subgraphs.
    #[serde(default)]
    pub branches: BTreeMap<String, Branch>,
    /// Start preconditions.
    #[serde(default)]
    pub requirements: Requirements,
    /// Command prefixes players may not use while the quest is active.
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// Run once when the quest ends with a success outcome.
    #[serde(default)]
    pub rewards: Vec<Instruction>,
    /// Run once when the quest ends with any other outcome.
    #[serde(default)]
    pub on_fail: Vec<Instruction>,
    /// Run once when the quest is stopped from outside.
    #[serde(default)]
    pub on_stop: Vec<Instruction>,
    /// When false, progress lives only in the session and is never persisted.
    #[serde(default = "default_true")]
    pub save_progress: bool,
}

impl QuestDefinition {
    /// Create an empty definition (used by tests and builders).
    #[must_use]
    pub fn new(id: impl Into<QuestId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            start_branch: None,
            branches: BTreeMap::new(),
            requirements: Requirements::default(),
            blocked_commands: Vec::new(),
            rewards: Vec::new(),
            on_fail: Vec::new(),
            on_stop: Vec::new(),
            save_progress: true,
        }
    }

    /// Builder: add a branch.
    #[must_use]
    pub fn with_branch(mut self, id: impl Into<String>, branch: Branch) -> Self {
        self.branches.insert(id.into(), branch);
        self
    }

    /// The start node of the quest, if it exists.
    #[must_use]
    pub fn start_ref(&self, default_branch: &str) -> Option<NodeRef> {
        let branch_id = self.start_branch.as_deref().unwrap_or(default_branch);
        let branch = self.branches.get(branch_id)?;
        branch
            .nodes
            .contains_key(&branch.start)
            .then(|| NodeRef::new(branch_id, branch.start.clone()))
    }

    /// Start node of a named branch, if it exists.
    #[must_use]
    pub fn branch_start(&self, branch_id: &str) -> Option<NodeRef> {
        let branch = self.branches.get(branch_id)?;
        branch
            .nodes
            .contains_key(&branch.start)
            .then(|| NodeRef::new(branch_id, branch.start.clone()))
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, at: &NodeRef) -> Option<&Node> {
        self.branches.get(&at.branch)?.nodes.get(&at.node)
    }

    /// Check structural invariants.
    ///
    /// Returns content warnings (dangling gotos) on success; a missing start
    /// branch or start node is an error, since the quest could never run.
    ///
    /// # Errors
    /// Returns the reason the definition is unusable.
    pub fn validate(&self, default_branch: &str, outcome_prefix: &str) -> Result<Vec<String>, String> {
        let branch_id = self.start_branch.as_deref().unwrap_or(default_branch);
        let Some(branch) = self.branches.get(branch_id) else {
            return Err(format!("start branch '{branch_id}' does not exist"));
        };
        if !branch.nodes.contains_key(&branch.start) {
            return Err(format!(
                "start node '{}' missing from branch '{branch_id}'",
                branch.start
            ));
        }
        for (bid, b) in &self.branches {
            if !b.nodes.contains_key(&b.start) {
                return Err(format!("start node '{}' missing from branch '{bid}'", b.start));
            }
        }

        let mut warnings = Vec::new();
        for (bid, b) in &self.branches {
            for (nid, node) in &b.nodes {
                for raw in node.all_targets() {
                    match Target::parse(raw, bid, outcome_prefix) {
                        Target::Outcome(_) => {}
                        Target::Node(r) => {
                            if self.node(&r).is_none() {
                                warnings.push(format!("{bid}:{nid} -> dangling goto '{raw}'"));
                            }
                        }
                        Target::Branch(br) => {
                            if self.branch_start(&br).is_none() {
                                warnings.push(format!("{bid}:{nid} -> unknown branch '{raw}'"));
                            }
                        }
                    }
                }
                if matches!(node.kind, NodeKind::Unknown) {
                    warnings.push(format!("{bid}:{nid} has an unknown type; it will be a no-op"));
                }
            }
        }
        Ok(warnings)
    }
}

/// A named subgraph of nodes with one start node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branch {
    /// Id of the first node.
    pub start: String,
    /// Nodes by id.
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
}

impl Branch {
    /// Create a branch starting at `start`.
    #[must_use]
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            nodes: BTreeMap::new(),
        }
    }

    /// Builder: add a node.
    #[must_use]
    pub fn with_node(mut self, id: impl Into<String>, node: Node) -> Self {
        self.nodes.insert(id.into(), node);
        self
    }
}

/// Start preconditions of a quest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    /// Permission node the player must hold.
    #[serde(default)]
    pub permission: Option<String>,
    /// Worlds the quest may be started in (empty = any).
    #[serde(default)]
    pub worlds: Vec<String>,
    /// Quests that must be completed first.
    #[serde(default)]
    pub prerequisites: Vec<QuestId>,
    /// Maximum number of completions.
    #[serde(default)]
    pub max_completions: Option<u32>,
    /// Seconds after a completion before the quest may start again.
    #[serde(default)]
    pub cooldown_secs: Option<i64>,
}

/// One instruction/state in a branch graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Behaviour and payload.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Single successor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    /// Ordered successors (first wins for non-random kinds).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gotos: Vec<String>,
    /// Successors for uniform random choice.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub random_gotos: Vec<String>,
    /// Ticks to wait after the node finishes before moving on.
    #[serde(default)]
    pub delay: u64,
    /// Label matched against the avoid-repeat history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Player-facing objective text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
}

impl Node {
    /// A node of the given kind with no successors.
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            goto: None,
            gotos: Vec::new(),
            random_gotos: Vec::new(),
            delay: 0,
            tag: None,
            objective: None,
        }
    }

    /// Builder: set the single successor.
    #[must_use]
    pub fn goto(mut self, target: impl Into<String>) -> Self {
        self.goto = Some(target.into());
        self
    }

    /// Builder: set random successors.
    #[must_use]
    pub fn random(mut self, targets: &[&str]) -> Self {
        self.random_gotos = targets.iter().map(|t| (*t).to_string()).collect();
        self
    }

    /// Builder: set the avoid-repeat tag.
    #[must_use]
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Builder: set the post-node delay.
    #[must_use]
    pub fn delayed(mut self, ticks: u64) -> Self {
        self.delay = ticks;
        self
    }

    /// Every goto string the node can transition to.
    #[must_use]
    pub fn all_targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        out.extend(self.goto.as_deref());
        out.extend(self.gotos.iter().map(String::as_str));
        out.extend(self.random_gotos.iter().map(String::as_str));
        match &self.kind {
            NodeKind::LogicSwitch { cases, .. } => out.extend(cases.iter().map(|c| c.goto.as_str())),
            NodeKind::ConditionSwitch { cases } => out.extend(cases.iter().map(|c| c.goto.as_str())),
            NodeKind::Group { children, .. } => out.extend(children.iter().map(String::as_str)),
            NodeKind::DialogMenu(menu) | NodeKind::GuiMenu(menu) => {
                for choice in &menu.choices {
                    out.extend(choice.goto.as_deref());
                    out.extend(choice.node.as_deref());
                }
            }
            _ => {}
        }
        out
    }
}

/// Node behaviour. Tagged by `type` in content files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    // --- control flow ---------------------------------------------------
    /// Wait/no-op: moves on after `delay`.
    #[serde(alias = "wait")]
    None,
    /// Ordered verb instructions with delay accumulation.
    Actions {
        /// Instructions in declared order.
        #[serde(default)]
        instructions: Vec<Instruction>,
    },
    /// Uniform pick among `random_gotos` (or `gotos`).
    Random {
        /// Skip successors whose tag is in the avoid-repeat history.
        #[serde(default)]
        avoid_repeat: bool,
    },
    /// Compare one scoped subject against ordered cases.
    LogicSwitch {
        /// Formula or placeholder to compare.
        subject: String,
        /// First satisfied case wins; otherwise `goto`.
        #[serde(default)]
        cases: Vec<LogicCase>,
    },
    /// Evaluate condition-group cases in order.
    ConditionSwitch {
        /// First satisfied case wins; otherwise `goto`.
        #[serde(default)]
        cases: Vec<ConditionCase>,
    },
    /// Idle until a matching interaction event.
    InteractGate {
        /// Target id (NPC, block, entity).
        target: String,
        /// Allowed interaction kinds (empty = any).
        #[serde(default)]
        kinds: Vec<InteractKind>,
    },
    /// Fan-out over children with a completion threshold.
    Group {
        /// Child node ids (same branch).
        children: Vec<String>,
        /// Children that must finish (default: all).
        #[serde(default)]
        required: Option<usize>,
        /// Run children in declared order instead of randomly.
        #[serde(default)]
        ordered: bool,
    },
    /// Chat-style choice menu.
    DialogMenu(MenuSpec),
    /// Inventory-style choice menu.
    GuiMenu(MenuSpec),

    // --- objectives (counted against world events) ----------------------
    /// Reach a location.
    ReachLocation {
        /// Destination.
        location: Location,
        /// Accepted distance.
        #[serde(default = "default_radius")]
        radius: f64,
    },
    /// Travel a cumulative distance.
    Travel {
        /// Blocks to travel.
        distance: f64,
    },
    /// Pick up items.
    ItemPickup(CountObjective),
    /// Consume items.
    ItemConsume(CountObjective),
    /// Craft items.
    ItemCraft(CountObjective),
    /// Trade for items.
    ItemTrade(CountObjective),
    /// Hand items to an NPC (taken on interaction).
    ItemDeliver {
        /// NPC target id.
        npc: String,
        /// Items required.
        items: Vec<ItemStack>,
    },
    /// Break blocks.
    BlockBreak(CountObjective),
    /// Place blocks.
    BlockPlace(CountObjective),
    /// Interact with blocks.
    BlockInteract(CountObjective),
    /// Kill entities.
    EntityKill(CountObjective),
    /// Damage entities (amount counts damage points).
    EntityDamage(CountObjective),
    /// Tame entities.
    EntityTame(CountObjective),
    /// Say a chat line containing `pattern`.
    Chat {
        /// Text to look for.
        pattern: String,
        /// Case-insensitive matching.
        #[serde(default)]
        ignore_case: bool,
    },
    /// Run a command starting with `prefix`.
    CommandLine {
        /// Command prefix (without leading slash).
        prefix: String,
    },
    /// Toggle sneak `amount` times.
    Sneak {
        /// Times to sneak.
        #[serde(default = "default_one")]
        amount: u32,
    },
    /// Wait a number of ticks, with optional reminders.
    Timer {
        /// Ticks to wait.
        ticks: u64,
        /// Periodic reminder.
        #[serde(default)]
        reminder: Option<Reminder>,
    },
    /// Connect to the server `amount` times.
    Connect {
        /// Logins required.
        #[serde(default = "default_one")]
        amount: u32,
    },
    /// Wait until a condition group holds (re-checked on every event).
    VariableWait {
        /// Conditions to satisfy.
        conditions: ConditionGroup,
    },
    /// Completed only through `complete_objective`.
    Objective,
    /// Ask an external navigation integration to guide the player.
    Navigate {
        /// Destination.
        destination: Location,
        /// Block until navigation completes.
        #[serde(default = "default_true")]
        wait: bool,
    },
    /// Prompt, then wait for a click or sneak.
    Prompt {
        /// Prompt text.
        text: String,
        /// How the player confirms.
        #[serde(default)]
        mode: PromptMode,
    },

    // --- single-shot domain actions -------------------------------------
    /// Send a chat message.
    Message {
        /// Text (placeholders allowed).
        text: String,
    },
    /// Give items.
    GiveItem(ItemStack),
    /// Take items.
    TakeItem(ItemStack),
    /// Dispatch a command.
    RunCommand {
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
    /// Start a timed cosmetic effect.
    Effect {
        /// Effect script id.
        effect: String,
        /// Run once or loop.
        #[serde(default)]
        mode: EffectMode,
    },
    /// Modify a variable.
    SetVariable(VariableChange),
    /// Start another quest.
    StartQuest {
        /// Quest to start.
        quest: QuestId,
    },
    /// Stop a quest (this one when absent).
    StopQuest {
        /// Quest to stop.
        #[serde(default)]
        quest: Option<QuestId>,
    },
    /// Grant pool tokens.
    PoolToken {
        /// Pool id.
        pool: String,
        /// Tokens to grant.
        #[serde(default = "default_one")]
        amount: u32,
    },
    /// Pay money through the economy integration.
    Money {
        /// Amount (negative withdraws).
        amount: f64,
    },
    /// Persist the current position immediately.
    Checkpoint,

    /// A tag this build does not know. Runs as a no-op.
    #[serde(other)]
    Unknown,
}

impl NodeKind {
    /// The single instruction a domain-action node runs, if it is one.
    #[must_use]
    pub fn as_instruction(&self) -> Option<Instruction> {
        Some(match self {
            Self::Message { text } => Instruction::Message { text: text.clone() },
            Self::GiveItem(stack) => Instruction::GiveItem(stack.clone()),
            Self::TakeItem(stack) => Instruction::TakeItem(stack.clone()),
            Self::RunCommand { command, sender } => Instruction::Command {
                command: command.clone(),
                sender: *sender,
            },
            Self::Teleport { location } => Instruction::Teleport {
                location: location.clone(),
            },
            Self::Effect { effect, mode } => Instruction::Effect {
                effect: effect.clone(),
                mode: *mode,
                at: None,
            },
            Self::SetVariable(change) => Instruction::Variable(change.clone()),
            Self::StartQuest { quest } => Instruction::StartQuest { quest: quest.clone() },
            Self::StopQuest { quest } => Instruction::StopQuest { quest: quest.clone() },
            Self::PoolToken { pool, amount } => Instruction::PoolToken {
                pool: pool.clone(),
                amount: *amount,
            },
            Self::Money { amount } => Instruction::Money { amount: *amount },
            Self::Prompt { text, mode } => Instruction::Prompt {
                text: text.clone(),
                mode: *mode,
            },
            Self::Navigate { destination, wait } => Instruction::Navigate {
                destination: destination.clone(),
                wait: *wait,
            },
            _ => return None,
        })
    }

    /// Whether the node waits for world events and counts progress.
    #[must_use]
    pub fn is_objective(&self) -> bool {
        matches!(
            self,
            Self::ReachLocation { .. }
                | Self::Travel { .. }
                | Self::ItemPickup(_)
                | Self::ItemConsume(_)
                | Self::ItemCraft(_)
                | Self::ItemTrade(_)
                | Self::ItemDeliver { .. }
                | Self::BlockBreak(_)
                | Self::BlockPlace(_)
                | Self::BlockInteract(_)
                | Self::EntityKill(_)
                | Self::EntityDamage(_)
                | Self::EntityTame(_)
                | Self::Chat { .. }
                | Self::CommandLine { .. }
                | Self::Sneak { .. }
                | Self::Timer { .. }
                | Self::Connect { .. }
                | Self::VariableWait { .. }
                | Self::Objective
                | Self::InteractGate { .. }
        )
    }
}

/// Counted objective payload shared by item/block/entity kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountObjective {
    /// Accepted names (empty = any).
    #[serde(default)]
    pub targets: Vec<String>,
    /// Amount required (per target when `per_target`).
    #[serde(default = "default_one")]
    pub amount: u32,
    /// Count each target separately (`branch:node:target` counters).
    #[serde(default)]
    pub per_target: bool,
}

impl CountObjective {
    /// Whether `name` is accepted.
    #[must_use]
    pub fn accepts(&self, name: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t.eq_ignore_ascii_case(name))
    }
}

/// Periodic reminder for timer objectives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    /// Ticks between reminders.
    pub every: u64,
    /// Reminder text.
    pub text: String,
}

/// Interaction kinds reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractKind {
    /// Primary click.
    Left,
    /// Secondary click.
    Right,
    /// Stepping on / physical trigger.
    Physical,
    /// NPC conversation start.
    Talk,
}

/// Menu payload for dialog and GUI menus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuSpec {
    /// Speaker name shown with the text.
    #[serde(default)]
    pub speaker: Option<String>,
    /// Menu body text.
    #[serde(default)]
    pub text: String,
    /// Selectable entries.
    #[serde(default)]
    pub choices: Vec<Choice>,
}

/// One selectable menu entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Entry label.
    pub text: String,
    /// Where selecting the entry goes.
    #[serde(default)]
    pub goto: Option<String>,
    /// Node to run by reference; its successor is replaced by `goto`.
    #[serde(default)]
    pub node: Option<String>,
    /// Visibility conditions (all groups must hold).
    #[serde(default)]
    pub conditions: Vec<ConditionGroup>,
}

// ---------------------------------------------------------------------------
// Goto targets
// ---------------------------------------------------------------------------

/// A parsed goto string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Move to a node.
    Node(NodeRef),
    /// Move to a branch's start node (`@branch`).
    Branch(String),
    /// End the quest with an outcome.
    Outcome(String),
}

impl Target {
    /// Parse `raw` relative to `current_branch`.
    ///
    /// Forms: `node`, `branch:node`, `@branch`, `<prefix>outcome`.
    #[must_use]
    pub fn parse(raw: &str, current_branch: &str, outcome_prefix: &str) -> Self {
        let raw = raw.trim();
        if !outcome_prefix.is_empty() {
            if let Some(outcome) = raw.strip_prefix(outcome_prefix) {
                return Self::Outcome(outcome.to_string());
            }
        }
        if let Some(branch) = raw.strip_prefix('@') {
            return Self::Branch(branch.to_string());
        }
        match raw.split_once(':') {
            Some((branch, node)) => Self::Node(NodeRef::new(branch, node)),
            None => Self::Node(NodeRef::new(current_branch, raw)),
        }
    }
}

fn default_true() -> bool { true }
fn default_one() -> u32 { 1 }
fn default_radius() -> f64 { 2.0 }

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "id": "intro",
            "branches": {
                "main": {
                    "start": "n1",
                    "nodes": {
                        "n1": { "type": "give_item", "item": "bread", "amount": 1, "goto": "n2" },
                        "n2": { "type": "logic_switch", "subject": "{var:count}",
                                "cases": [{ "op": ">=", "value": "5", "goto": "n3" }],
                                "goto": "n1" },
                        "n3": { "type": "teleport_to_moon", "goto": "end:success" }
                    }
                }
            }
        }"#
    }

    #[test]
    fn parses_tagged_nodes_and_unknown_tags() {
        let def: QuestDefinition = serde_json::from_str(sample_json()).expect("parse");
        let n1 = def.node(&NodeRef::new("main", "n1")).expect("n1");
        assert!(matches!(n1.kind, NodeKind::GiveItem(ref s) if s.item == "bread"));
        assert_eq!(n1.goto.as_deref(), Some("n2"));
        let n3 = def.node(&NodeRef::new("main", "n3")).expect("n3");
        assert!(matches!(n3.kind, NodeKind::Unknown));
        assert!(def.save_progress);
    }

    #[test]
    fn validate_reports_dangling_and_rejects_missing_start() {
        let mut def: QuestDefinition = serde_json::from_str(sample_json()).expect("parse");
        let warnings = def.validate("main", "end:").expect("valid");
        assert_eq!(warnings.len(), 1, "only the unknown node type: {warnings:?}");

        if let Some(branch) = def.branches.get_mut("main") {
            if let Some(node) = branch.nodes.get_mut("n2") {
                node.goto = Some("nowhere".into());
            }
        }
        let warnings = def.validate("main", "end:").expect("still valid");
        assert!(warnings.iter().any(|w| w.contains("nowhere")));

        def.branches.get_mut("main").map(|b| b.start = "missing".into());
        assert!(def.validate("main", "end:").is_err());
    }

    #[test]
    fn target_forms() {
        assert_eq!(
            Target::parse("n2", "main", "end:"),
            Target::Node(NodeRef::new("main", "n2"))
        );
        assert_eq!(
            Target::parse("side:a", "main", "end:"),
            Target::Node(NodeRef::new("side", "a"))
        );
        assert_eq!(Target::parse("@side", "main", "end:"), Target::Branch("side".into()));
        assert_eq!(
            Target::parse("end:fail", "main", "end:"),
            Target::Outcome("fail".into())
        );
    }

    #[test]
    fn msgpack_named_round_trip_keeps_flattened_kind() {
        let def: QuestDefinition = serde_json::from_str(sample_json()).expect("parse");
        let bytes = rmp_serde::to_vec_named(&def).expect("encode");
        let back: QuestDefinition = rmp_serde::from_slice(&bytes).expect("decode");
        let n2 = back.node(&NodeRef::new("main", "n2")).expect("n2");
        assert!(matches!(n2.kind, NodeKind::LogicSwitch { ref cases, .. } if cases.len() == 1));
    }
}
