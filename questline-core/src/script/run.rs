//! The branch run loop and per-node dispatch.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::definition::NodeKind;
use crate::host::{Host, MenuStyle};
use crate::metrics::{QuestCounters, spans};
use crate::scheduler::TaskAction;
use crate::types::NodeRef;

use super::QuestEngine;
use super::goto::Resolution;
use super::session::Session;

/// How the run loop enters a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Execute the node under the cursor.
    Execute,
    /// The node under the cursor finished; follow its goto (or `chosen`).
    Finish(Option<String>),
}

/// What executing one node asks the loop to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    /// The node finished; resolve its goto (a chosen target overrides it).
    Next(Option<String>),
    /// The node moved the cursor itself; execute the new position.
    Moved,
    /// Waiting on an event, token or scheduled task.
    Suspend,
    /// The branch stopped.
    Halt,
    /// The quest was stopped from inside.
    Stop,
}

impl QuestEngine {
    /// Drive one branch until it suspends, halts, ends or runs out of
    /// steps for this tick (the remainder is rescheduled for the next).
    pub(crate) fn run_branch(&mut self, session: &mut Session, branch: String, entry: Entry, host: &mut dyn Host) {
        let mut branch = branch;
        let mut entry = entry;
        let max_steps = self.config.interpreter.max_steps_per_tick;

        loop {
            if session.ended {
                return;
            }
            match entry {
                Entry::Execute => {
                    if !session.take_step(self.now_tick, max_steps) {
                        debug!(player = %session.player, quest = %session.quest, %branch, "Step budget spent; continuing next tick");
                        self.schedule(session.player, &session.quest, &branch, 1, TaskAction::Run);
                        return;
                    }
                    match self.execute_node(session, &branch, host) {
                        Flow::Next(chosen) => entry = Entry::Finish(chosen),
                        Flow::Moved => entry = Entry::Execute,
                        Flow::Suspend | Flow::Halt => return,
                        Flow::Stop => {
                            self.stop_session(session, host);
                            return;
                        }
                    }
                }
                Entry::Finish(chosen) => {
                    let delay = self
                        .cursor(session, &branch)
                        .and_then(|c| session.definition.node(&NodeRef::new(branch.as_str(), c.node)).map(|n| n.delay))
                        .unwrap_or(0);
                    match self.resolve_goto(session, &branch, chosen) {
                        Resolution::Moved(to) => {
                            branch = to.branch;
                            if delay > 0 {
                                self.with_cursor(session, &branch, |c| c.wait = Some(delay));
                                self.schedule(session.player, &session.quest, &branch, delay, TaskAction::Run);
                                return;
                            }
                            entry = Entry::Execute;
                        }
                        Resolution::End(outcome) => {
                            self.end_quest(session, &outcome, host);
                            return;
                        }
                        Resolution::Park => return,
                    }
                }
            }
        }
    }

    /// Execute the node under a branch cursor.
    fn execute_node(&mut self, session: &mut Session, branch: &str, host: &mut dyn Host) -> Flow {
        let Some(cursor) = self.cursor(session, branch) else {
            return Flow::Halt;
        };
        if cursor.wait.is_some() {
            self.with_cursor(session, branch, |c| c.wait = None);
        }
        let at = NodeRef::new(branch, cursor.node.as_str());
        let def = Arc::clone(&session.definition);
        let Some(node) = def.node(&at) else {
            warn!(player = %session.player, quest = %session.quest, node = %at, "Cursor points at a missing node; branch halted");
            QuestCounters::bump(&self.counters.content_errors);
            return Flow::Halt;
        };

        QuestCounters::bump(&self.counters.nodes_executed);
        let _span = tracing::trace_span!(spans::NODE, node = %at).entered();

        if let Some(tag) = &node.tag {
            let limit = self.config.interpreter.history_limit;
            self.with_progress(session, |p| p.remember(tag, limit));
        }

        let resume = cursor.resume_at.unwrap_or(0);
        match &node.kind {
            NodeKind::None => Flow::Next(None),
            NodeKind::Actions { instructions } => self.run_instructions(session, &at, instructions, resume, host),
            NodeKind::Random { avoid_repeat } => Flow::Next(self.pick_random(session, node, branch, *avoid_repeat)),
            NodeKind::LogicSwitch { subject, cases } => {
                let scope = self.scope(session.player, Some(&session.quest), &*host);
                Flow::Next(
                    cases
                        .iter()
                        .find(|c| scope.compare(subject, c.op, &c.value))
                        .map(|c| c.goto.clone()),
                )
            }
            NodeKind::ConditionSwitch { cases } => {
                let scope = super::Scope {
                    player: session.player,
                    quest: Some(&session.quest),
                    state: self.cache.peek(session.player),
                    server: self.cache.server(),
                    host: &*host,
                };
                let rng = &mut self.rng;
                Flow::Next(
                    cases
                        .iter()
                        .find(|c| scope.all_groups(&c.groups, rng))
                        .map(|c| c.goto.clone()),
                )
            }
            NodeKind::Group {
                children,
                required,
                ordered,
            } => self.enter_group(session, &at, children, *required, *ordered, cursor.group),
            NodeKind::DialogMenu(menu) => self.open_menu(session, &at, menu, MenuStyle::Dialog, host),
            NodeKind::GuiMenu(menu) => self.open_menu(session, &at, menu, MenuStyle::Gui, host),
            NodeKind::ReachLocation { location, radius } => {
                let arrived = host
                    .location_of(session.player)
                    .and_then(|here| here.distance(location))
                    .is_some_and(|d| d <= *radius);
                if arrived { Flow::Next(None) } else { Flow::Suspend }
            }
            NodeKind::VariableWait { conditions } => {
                let scope = super::Scope {
                    player: session.player,
                    quest: Some(&session.quest),
                    state: self.cache.peek(session.player),
                    server: self.cache.server(),
                    host: &*host,
                };
                if scope.group(conditions, &mut self.rng) {
                    Flow::Next(None)
                } else {
                    Flow::Suspend
                }
            }
            NodeKind::Connect { amount } => {
                let done = self
                    .progress(session.player, &session.quest)
                    .map_or(0.0, |p| p.counter(&at.counter_key()));
                if done >= f64::from(*amount) { Flow::Next(None) } else { Flow::Suspend }
            }
            NodeKind::Timer { ticks, reminder } => self.start_timer(session, &at, *ticks, reminder.as_ref()),
            NodeKind::InteractGate { .. }
            | NodeKind::Travel { .. }
            | NodeKind::ItemPickup(_)
            | NodeKind::ItemConsume(_)
            | NodeKind::ItemCraft(_)
            | NodeKind::ItemTrade(_)
            | NodeKind::ItemDeliver { .. }
            | NodeKind::BlockBreak(_)
            | NodeKind::BlockPlace(_)
            | NodeKind::BlockInteract(_)
            | NodeKind::EntityKill(_)
            | NodeKind::EntityDamage(_)
            | NodeKind::EntityTame(_)
            | NodeKind::Chat { .. }
            | NodeKind::CommandLine { .. }
            | NodeKind::Sneak { .. }
            | NodeKind::Objective => Flow::Suspend,
            kind @ (NodeKind::Message { .. }
            | NodeKind::GiveItem(_)
            | NodeKind::TakeItem(_)
            | NodeKind::RunCommand { .. }
            | NodeKind::Teleport { .. }
            | NodeKind::Effect { .. }
            | NodeKind::SetVariable(_)
            | NodeKind::StartQuest { .. }
            | NodeKind::StopQuest { .. }
            | NodeKind::PoolToken { .. }
            | NodeKind::Money { .. }
            | NodeKind::Prompt { .. }
            | NodeKind::Navigate { .. }) => match kind.as_instruction() {
                Some(instruction) => {
                    self.run_instructions(session, &at, std::slice::from_ref(&instruction), resume, host)
                }
                None => Flow::Next(None),
            },
            NodeKind::Checkpoint => {
                self.flush_requested = true;
                Flow::Next(None)
            }
            NodeKind::Unknown => {
                warn!(quest = %session.quest, node = %at, "Unknown node type; skipped");
                QuestCounters::bump(&self.counters.content_errors);
                Flow::Next(None)
            }
        }
    }
}
