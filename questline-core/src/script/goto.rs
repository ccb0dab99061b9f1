//! Goto resolution, groups, and quest termination.
//!
//! Resolution order when a node finishes:
//!
//! 1. a group member hands control back to its group (next child, or the
//!    group itself finishes once its threshold is met);
//! 2. a pending choice-by-reference override for the branch;
//! 3. the explicit choice, `goto`, a `random_gotos` pick, then the first
//!    of `gotos`;
//! 4. no target parks the cursor on the finished node.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::definition::{Node, QuestDefinition, Target};
use crate::error::{QuestError, Result};
use crate::host::Host;
use crate::metrics::QuestCounters;
use crate::state::{Cursor, GroupState};
use crate::types::NodeRef;

use super::QuestEngine;
use super::run::{Entry, Flow};
use super::session::{Pending, Session};

/// Where a finished node leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// The cursor moved; execute the new position.
    Moved(NodeRef),
    /// The quest ends with this outcome.
    End(String),
    /// No target; the cursor stays on the finished node.
    Park,
}

enum GroupStep {
    NotMember,
    Next(String),
    Complete(Option<String>),
}

impl QuestEngine {
    /// Follow the goto of the node under a branch cursor.
    pub(crate) fn resolve_goto(&mut self, session: &mut Session, branch: &str, chosen: Option<String>) -> Resolution {
        let Some(cursor) = self.cursor(session, branch) else {
            return Resolution::Park;
        };
        let finished = NodeRef::new(branch, cursor.node.as_str());
        self.with_progress(session, |p| {
            p.clear_counters(&finished);
            p.objectives.insert(finished.counter_key());
            if let Some(c) = p.cursors.get_mut(branch) {
                c.resume_at = None;
            }
        });

        if let Some(group) = cursor.group.as_deref() {
            match self.group_step(session, branch, group, &finished.node) {
                GroupStep::Next(child) => {
                    let to = NodeRef::new(branch, child.as_str());
                    self.set_cursor(session, &to, Some(group.to_string()));
                    return Resolution::Moved(to);
                }
                GroupStep::Complete(parent) => {
                    self.set_cursor(session, &NodeRef::new(branch, group), parent);
                    return self.resolve_goto(session, branch, None);
                }
                GroupStep::NotMember => {}
            }
        }

        let def = Arc::clone(&session.definition);
        let Some(node) = def.node(&finished) else {
            return Resolution::Park;
        };
        let raw = session
            .choice_overrides
            .remove(branch)
            .or(chosen)
            .or_else(|| node.goto.clone())
            .or_else(|| self.pick_target(session, &node.random_gotos, branch, false))
            .or_else(|| node.gotos.first().cloned());
        let Some(raw) = raw else {
            debug!(quest = %session.quest, node = %finished, "No successor; cursor parked");
            return Resolution::Park;
        };
        self.apply_target(session, branch, &raw)
    }

    /// Move a branch cursor to a raw goto target.
    pub(crate) fn apply_target(&mut self, session: &mut Session, branch: &str, raw: &str) -> Resolution {
        let to = match self.target(raw, branch) {
            Target::Outcome(outcome) => return Resolution::End(outcome),
            Target::Branch(b) => session.definition.branch_start(&b),
            Target::Node(to) => session.definition.node(&to).is_some().then_some(to),
        };
        let Some(to) = to else {
            warn!(quest = %session.quest, %branch, target = raw, "Goto names a missing node or branch; cursor parked");
            QuestCounters::bump(&self.counters.content_errors);
            return Resolution::Park;
        };
        if to.branch != branch {
            self.with_progress(session, |p| p.cursors.remove(branch));
        }
        self.set_cursor(session, &to, None);
        Resolution::Moved(to)
    }

    /// Successor of a random node: a pick among `random_gotos`, or among
    /// `gotos` when the node declares no random targets.
    pub(crate) fn pick_random(&mut self, session: &Session, node: &Node, branch: &str, avoid_repeat: bool) -> Option<String> {
        let candidates = if node.random_gotos.is_empty() {
            &node.gotos
        } else {
            &node.random_gotos
        };
        self.pick_target(session, candidates, branch, avoid_repeat)
    }

    /// Pick a random successor among `candidates`. With `avoid_repeat`,
    /// successors whose tag (or outcome) is in the history are skipped
    /// unless every candidate is.
    pub(crate) fn pick_target(
        &mut self,
        session: &Session,
        candidates: &[String],
        branch: &str,
        avoid_repeat: bool,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let fresh: Vec<&String> = if avoid_repeat {
            let progress = self
                .cache
                .peek(session.player)
                .and_then(|s| s.active.get(&session.quest));
            candidates
                .iter()
                .filter(|c| {
                    self.history_key(&session.definition, c, branch)
                        .is_none_or(|key| !progress.is_some_and(|p| p.remembers(&key)))
                })
                .collect()
        } else {
            candidates.iter().collect()
        };
        let pool: Vec<&String> = if fresh.is_empty() {
            candidates.iter().collect()
        } else {
            fresh
        };
        pool.choose(&mut self.rng).map(|c| (*c).clone())
    }

    /// History entry a target would leave behind: the tag of a node, or
    /// the outcome name.
    fn history_key(&self, def: &QuestDefinition, raw: &str, branch: &str) -> Option<String> {
        match self.target(raw, branch) {
            Target::Outcome(outcome) => Some(outcome),
            Target::Branch(b) => def.branch_start(&b).and_then(|r| def.node(&r)?.tag.clone()),
            Target::Node(r) => def.node(&r)?.tag.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// Start a group: record its bookkeeping and move the cursor to the
    /// first child.
    pub(crate) fn enter_group(
        &mut self,
        session: &mut Session,
        at: &NodeRef,
        children: &[String],
        required: Option<usize>,
        ordered: bool,
        parent: Option<String>,
    ) -> Flow {
        let def = Arc::clone(&session.definition);
        let mut members = Vec::with_capacity(children.len());
        for child in children {
            if def.node(&NodeRef::new(at.branch.as_str(), child.as_str())).is_some() {
                members.push(child.clone());
            } else {
                warn!(quest = %session.quest, group = %at, child = %child, "Group child does not exist; skipped");
                QuestCounters::bump(&self.counters.content_errors);
            }
        }
        let required = required.unwrap_or(members.len()).min(members.len());
        if required == 0 {
            return Flow::Next(None);
        }

        let group = GroupState {
            remaining: members,
            done: 0,
            required,
            ordered,
            parent,
        };
        let Some(first) = pick_child(&group, &mut self.rng) else {
            return Flow::Next(None);
        };
        let key = at.counter_key();
        self.with_progress(session, |p| {
            p.groups.insert(key, group);
        });
        self.set_cursor(session, &NodeRef::new(at.branch.as_str(), first), Some(at.node.clone()));
        Flow::Moved
    }

    /// Count a finished child toward its group.
    fn group_step(&mut self, session: &Session, branch: &str, group_node: &str, finished: &str) -> GroupStep {
        let key = NodeRef::new(branch, group_node).counter_key();
        let now = self.now();
        let Ok(state) = self.cache.state_mut(session.player, now) else {
            return GroupStep::NotMember;
        };
        let Some(progress) = state.active.get_mut(&session.quest) else {
            return GroupStep::NotMember;
        };
        let Some(group) = progress.groups.get_mut(&key) else {
            return GroupStep::NotMember;
        };
        let Some(pos) = group.remaining.iter().position(|c| c == finished) else {
            return GroupStep::NotMember;
        };
        group.remaining.remove(pos);
        group.done += 1;

        let next = if group.is_complete() {
            None
        } else {
            pick_child(group, &mut self.rng)
        };
        match next {
            Some(child) => GroupStep::Next(child),
            None => {
                let parent = group.parent.clone();
                progress.groups.remove(&key);
                GroupStep::Complete(parent)
            }
        }
    }

    fn set_cursor(&mut self, session: &Session, to: &NodeRef, group: Option<String>) {
        self.with_progress(session, |p| {
            p.cursors.insert(
                to.branch.clone(),
                Cursor {
                    node: to.node.clone(),
                    group,
                    resume_at: None,
                    wait: None,
                },
            );
        });
    }

    // -----------------------------------------------------------------------
    // External completion and jumps
    // -----------------------------------------------------------------------

    /// Finish `node` from outside the script.
    pub(crate) fn complete_in_session(&mut self, session: &mut Session, node: &str, host: &mut dyn Host) -> Result<()> {
        let progress = self
            .cache
            .peek(session.player)
            .and_then(|s| s.active.get(&session.quest));
        let current = progress.and_then(|p| {
            p.cursors
                .iter()
                .find(|(_, c)| c.node == node && c.wait.is_none())
                .map(|(b, _)| b.clone())
        });
        let member = progress.and_then(|p| {
            p.groups
                .iter()
                .find(|(_, g)| g.remaining.iter().any(|c| c == node))
                .and_then(|(key, _)| key.split_once(':'))
                .map(|(b, g)| (b.to_string(), g.to_string()))
        });

        if let Some(branch) = current {
            self.clear_waits(session, &branch, host);
            self.run_branch(session, branch, Entry::Finish(None), host);
            return Ok(());
        }

        if let Some((branch, group)) = member {
            if let GroupStep::Complete(parent) = self.group_step(session, &branch, &group, node) {
                self.clear_waits(session, &branch, host);
                if let Some(abandoned) = self.cursor(session, &branch) {
                    let abandoned = NodeRef::new(branch.as_str(), abandoned.node);
                    self.with_progress(session, |p| p.clear_counters(&abandoned));
                }
                self.set_cursor(session, &NodeRef::new(branch.as_str(), group), parent);
                self.run_branch(session, branch, Entry::Finish(None), host);
            }
            return Ok(());
        }

        Err(QuestError::UnknownNode {
            quest: session.quest.clone(),
            branch: self.config.interpreter.start_branch.clone(),
            node: node.to_string(),
        })
    }

    /// Move a cursor to `raw` from outside the script.
    pub(crate) fn jump(&mut self, session: &mut Session, raw: &str, host: &mut dyn Host) -> Result<()> {
        let from = self
            .progress(session.player, &session.quest)
            .and_then(|p| p.cursors.keys().next().cloned())
            .unwrap_or_else(|| self.config.interpreter.start_branch.clone());
        let to = match self.target(raw, &from) {
            Target::Outcome(outcome) => {
                self.end_quest(session, &outcome, host);
                return Ok(());
            }
            Target::Branch(b) => session
                .definition
                .branch_start(&b)
                .ok_or_else(|| QuestError::UnknownBranch {
                    quest: session.quest.clone(),
                    branch: b,
                })?,
            Target::Node(to) => {
                if session.definition.node(&to).is_none() {
                    return Err(QuestError::UnknownNode {
                        quest: session.quest.clone(),
                        branch: to.branch,
                        node: to.node,
                    });
                }
                to
            }
        };

        self.clear_waits(session, &from, host);
        if to.branch != from {
            self.clear_waits(session, &to.branch, host);
        }
        let group_prefix = format!("{from}:");
        self.with_progress(session, |p| {
            p.groups.retain(|k, _| !k.starts_with(&group_prefix));
            if to.branch != from {
                p.cursors.remove(&from);
            }
        });
        self.set_cursor(session, &to, None);
        debug!(player = %session.player, quest = %session.quest, to = %to, "Cursor moved externally");
        self.run_branch(session, to.branch, Entry::Execute, host);
        Ok(())
    }

    /// Drop everything a branch is waiting on: scheduled tasks, tokens,
    /// open menus and navigation.
    pub(crate) fn clear_waits(&mut self, session: &mut Session, branch: &str, host: &mut dyn Host) {
        self.scheduler.cancel_branch(session.player, &session.quest, branch);
        let had_menu = session
            .pending
            .values()
            .any(|p| p.branch() == branch && matches!(p, Pending::Menu(_)));
        let had_navigation = session
            .pending
            .values()
            .any(|p| p.branch() == branch && matches!(p, Pending::Navigation { .. }));
        let tokens = session.clear_branch(branch);
        self.release_tokens(&tokens);
        if had_menu {
            host.close_menu(session.player);
        }
        if had_navigation {
            if let Some(nav) = self.caps.navigator.as_mut() {
                nav.cancel(session.player);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// End the quest with an outcome: record history and completion, run
    /// rewards or the failure hook, drop progress.
    pub(crate) fn end_quest(&mut self, session: &mut Session, outcome: &str, host: &mut dyn Host) {
        let player = session.player;
        let quest = session.quest.clone();
        let def = Arc::clone(&session.definition);
        let success = self
            .config
            .interpreter
            .success_outcomes
            .iter()
            .any(|o| o == outcome);
        let limit = self.config.interpreter.history_limit;
        self.teardown(session, host);

        let now = self.now();
        let recorded = self.cache.modify(player, now, |state| {
            if let Some(progress) = state.active.get_mut(&quest) {
                progress.remember(outcome, limit);
                let history = progress.history.clone();
                state.histories.insert(quest.clone(), history);
            }
            if success {
                state.record_completion(&quest, now);
            }
        });
        if let Err(e) = recorded {
            error!(%player, %quest, error = %e, "Could not record quest outcome");
        }

        let hooks = if success { &def.rewards } else { &def.on_fail };
        self.run_detached(player, &quest, hooks, host);
        self.drop_progress(player, &quest);

        QuestCounters::bump(&self.counters.quests_ended);
        if success {
            QuestCounters::bump(&self.counters.quests_completed);
        }
        info!(%player, %quest, outcome, success, "Quest ended");
    }

    /// Stop a live session: teardown, stop hook, drop progress.
    pub(crate) fn stop_session(&mut self, session: &mut Session, host: &mut dyn Host) {
        let player = session.player;
        let quest = session.quest.clone();
        let def = Arc::clone(&session.definition);
        self.teardown(session, host);
        self.run_detached(player, &quest, &def.on_stop, host);
        self.drop_progress(player, &quest);
        QuestCounters::bump(&self.counters.quests_ended);
        info!(%player, %quest, "Quest stopped");
    }

    /// Cancel a session's tasks, continuations, menus, navigation and
    /// effects, and mark it ended.
    pub(crate) fn teardown(&mut self, session: &mut Session, host: &mut dyn Host) {
        let player = session.player;
        self.scheduler.cancel_quest(player, &session.quest);
        if session.has_menu() {
            host.close_menu(player);
        }
        if session.has_navigation() {
            if let Some(nav) = self.caps.navigator.as_mut() {
                nav.cancel(player);
            }
        }
        let tokens: Vec<u64> = session.pending.keys().copied().collect();
        self.release_tokens(&tokens);
        session.pending.clear();
        session.choice_overrides.clear();
        if let Some(fx) = self.caps.effects.as_mut() {
            fx.cancel_quest(player, &session.quest);
        }
        session.ended = true;
    }

    fn drop_progress(&mut self, player: crate::types::PlayerId, quest: &crate::types::QuestId) {
        let now = self.now();
        if let Err(e) = self.cache.modify(player, now, |state| state.active.remove(quest)) {
            error!(%player, %quest, error = %e, "Could not drop quest progress");
        }
    }
}

/// Next child of a group: declared order, or uniformly random.
fn pick_child(group: &GroupState, rng: &mut StdRng) -> Option<String> {
    if group.ordered {
        group.remaining.first().cloned()
    } else {
        group.remaining.choose(rng).cloned()
    }
}
