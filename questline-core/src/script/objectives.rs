//! Objective nodes: matching world events, counting progress, timers.

use tracing::{debug, trace};

use crate::definition::{CountObjective, InteractKind, NodeKind, Reminder};
use crate::events::WorldEvent;
use crate::host::Host;
use crate::primitives;
use crate::scheduler::TaskAction;
use crate::state::QuestProgress;
use crate::types::NodeRef;

use super::run::{Entry, Flow};
use super::session::Session;
use super::{QuestEngine, Scope};

impl QuestEngine {
    /// Offer an event to every cursor of a session. Returns how many
    /// nodes finished because of it.
    pub(crate) fn dispatch_event(&mut self, session: &mut Session, event: &WorldEvent, host: &mut dyn Host) -> usize {
        let mut advanced = 0;
        if matches!(event, WorldEvent::Sneak) {
            advanced += self.resume_sneak_prompts(session, host);
        }
        let branches: Vec<String> = self
            .progress(session.player, &session.quest)
            .map(|p| p.cursors.keys().cloned().collect())
            .unwrap_or_default();
        for branch in branches {
            if session.ended {
                break;
            }
            if self.objective_met(session, &branch, event, host) {
                trace!(player = %session.player, quest = %session.quest, %branch, event = event.name(), "Objective met");
                advanced += 1;
                self.run_branch(session, branch, Entry::Finish(None), host);
            }
        }
        advanced
    }

    /// Count `event` against the node under a branch cursor and report
    /// whether the node is now complete.
    fn objective_met(&mut self, session: &Session, branch: &str, event: &WorldEvent, host: &mut dyn Host) -> bool {
        let Some(cursor) = self.cursor(session, branch) else {
            return false;
        };
        if cursor.resume_at.is_some() || cursor.wait.is_some() {
            return false;
        }
        let at = NodeRef::new(branch, cursor.node.as_str());
        let def = std::sync::Arc::clone(&session.definition);
        let Some(node) = def.node(&at) else {
            return false;
        };

        match (&node.kind, event) {
            (NodeKind::ReachLocation { location, radius }, WorldEvent::Move { to, .. }) => {
                to.distance(location).is_some_and(|d| d <= *radius)
            }
            (NodeKind::Travel { distance }, WorldEvent::Move { from, to }) => {
                let step = from.distance(to).unwrap_or(0.0);
                step > 0.0 && self.add(session, &at.counter_key(), step) >= *distance
            }
            (NodeKind::ItemPickup(goal), WorldEvent::ItemPickup { item, amount })
            | (NodeKind::ItemCraft(goal), WorldEvent::ItemCraft { item, amount })
            | (NodeKind::ItemTrade(goal), WorldEvent::ItemTrade { item, amount }) => {
                self.count(session, &at, goal, item, f64::from(*amount))
            }
            (NodeKind::ItemConsume(goal), WorldEvent::ItemConsume { item }) => self.count(session, &at, goal, item, 1.0),
            (NodeKind::BlockBreak(goal), WorldEvent::BlockBreak { block })
            | (NodeKind::BlockPlace(goal), WorldEvent::BlockPlace { block })
            | (NodeKind::BlockInteract(goal), WorldEvent::BlockInteract { block }) => {
                self.count(session, &at, goal, block, 1.0)
            }
            (NodeKind::EntityKill(goal), WorldEvent::EntityKill { entity })
            | (NodeKind::EntityTame(goal), WorldEvent::EntityTame { entity }) => {
                self.count(session, &at, goal, entity, 1.0)
            }
            (NodeKind::EntityDamage(goal), WorldEvent::EntityDamage { entity, damage }) => {
                self.count(session, &at, goal, entity, *damage)
            }
            (NodeKind::Chat { pattern, ignore_case }, WorldEvent::Chat { message }) => {
                let pattern = self.interpolate(session.player, &session.quest, &*host, pattern);
                if *ignore_case {
                    message.to_lowercase().contains(&pattern.to_lowercase())
                } else {
                    message.contains(&pattern)
                }
            }
            (NodeKind::CommandLine { prefix }, WorldEvent::Command { command }) => {
                let prefix = prefix.trim_start_matches('/');
                !prefix.is_empty()
                    && command
                        .trim_start_matches('/')
                        .to_lowercase()
                        .starts_with(&prefix.to_lowercase())
            }
            (NodeKind::Sneak { amount }, WorldEvent::Sneak) => {
                self.add(session, &at.counter_key(), 1.0) >= f64::from(*amount)
            }
            (NodeKind::InteractGate { target, kinds }, WorldEvent::Interact { target: t, kind }) => {
                target.eq_ignore_ascii_case(t) && (kinds.is_empty() || kinds.contains(kind))
            }
            (NodeKind::ItemDeliver { npc, items }, WorldEvent::Interact { target, kind }) => {
                if !npc.eq_ignore_ascii_case(target) || *kind == InteractKind::Physical {
                    return false;
                }
                if !primitives::has_items(&*host, session.player, items) {
                    debug!(player = %session.player, %npc, "Delivery incomplete; items missing");
                    return false;
                }
                items.iter().all(|stack| primitives::take_item(host, session.player, stack))
            }
            (NodeKind::VariableWait { conditions }, _) => {
                let scope = Scope {
                    player: session.player,
                    quest: Some(&session.quest),
                    state: self.cache.peek(session.player),
                    server: self.cache.server(),
                    host: &*host,
                };
                scope.group(conditions, &mut self.rng)
            }
            _ => false,
        }
    }

    fn add(&mut self, session: &Session, key: &str, amount: f64) -> f64 {
        self.with_progress(session, |p| p.add_counter(key, amount))
            .unwrap_or(0.0)
    }

    /// Count toward an item/block/entity goal.
    fn count(&mut self, session: &Session, at: &NodeRef, goal: &CountObjective, name: &str, amount: f64) -> bool {
        if !goal.accepts(name) || amount <= 0.0 {
            return false;
        }
        let required = f64::from(goal.amount);
        if goal.per_target && !goal.targets.is_empty() {
            let Some(target) = goal.targets.iter().find(|t| t.eq_ignore_ascii_case(name)) else {
                return false;
            };
            let key = at.goal_key(target);
            self.with_progress(session, |p| {
                p.add_counter(&key, amount);
                goal.targets
                    .iter()
                    .all(|t| p.counter(&at.goal_key(t)) >= required)
            })
            .unwrap_or(false)
        } else {
            self.add(session, &at.counter_key(), amount) >= required
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Begin (or continue after a reconnect) a timer objective.
    pub(crate) fn start_timer(&mut self, session: &Session, at: &NodeRef, ticks: u64, reminder: Option<&Reminder>) -> Flow {
        let elapsed = self
            .progress(session.player, &session.quest)
            .map_or(0.0, |p| p.counter(&at.counter_key()));
        let remaining = ticks.saturating_sub(to_ticks(elapsed));
        if remaining == 0 {
            return Flow::Next(None);
        }
        self.schedule_timer_chunk(session, at, remaining, reminder);
        Flow::Suspend
    }

    fn schedule_timer_chunk(&mut self, session: &Session, at: &NodeRef, remaining: u64, reminder: Option<&Reminder>) {
        let chunk = reminder
            .map_or(remaining, |r| r.every.max(1))
            .min(remaining);
        self.schedule(
            session.player,
            &session.quest,
            &at.branch,
            chunk,
            TaskAction::Timer {
                node: at.node.clone(),
                ticks: chunk,
            },
        );
    }

    /// A timer chunk elapsed.
    pub(crate) fn timer_elapsed(&mut self, session: &mut Session, branch: &str, node: &str, ticks: u64, host: &mut dyn Host) {
        let at = NodeRef::new(branch, node);
        if self.cursor(session, branch).is_none_or(|c| c.node != node) {
            return;
        }
        let def = std::sync::Arc::clone(&session.definition);
        let Some(NodeKind::Timer { ticks: total, reminder }) = def.node(&at).map(|n| &n.kind) else {
            return;
        };
        #[allow(clippy::cast_precision_loss)]
        let elapsed = to_ticks(self.add(session, &at.counter_key(), ticks as f64));
        if elapsed >= *total {
            self.run_branch(session, branch.to_string(), Entry::Finish(None), host);
            return;
        }
        if let Some(reminder) = reminder {
            let text = self.interpolate(session.player, &session.quest, &*host, &reminder.text);
            primitives::send_message(host, session.player, &text);
        }
        self.schedule_timer_chunk(session, &at, total - elapsed, reminder.as_ref());
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_ticks(value: f64) -> u64 {
    value.max(0.0) as u64
}

/// `(current, required)` progress of a node for display.
pub(crate) fn measure(kind: &NodeKind, at: &NodeRef, progress: &QuestProgress) -> (f64, f64) {
    let own = progress.counter(&at.counter_key());
    match kind {
        NodeKind::ItemPickup(goal)
        | NodeKind::ItemConsume(goal)
        | NodeKind::ItemCraft(goal)
        | NodeKind::ItemTrade(goal)
        | NodeKind::BlockBreak(goal)
        | NodeKind::BlockPlace(goal)
        | NodeKind::BlockInteract(goal)
        | NodeKind::EntityKill(goal)
        | NodeKind::EntityDamage(goal)
        | NodeKind::EntityTame(goal) => {
            let required = f64::from(goal.amount);
            if goal.per_target && !goal.targets.is_empty() {
                #[allow(clippy::cast_precision_loss)]
                let targets = goal.targets.len() as f64;
                let current = goal
                    .targets
                    .iter()
                    .map(|t| progress.counter(&at.goal_key(t)).min(required))
                    .sum();
                (current, required * targets)
            } else {
                (own.min(required), required)
            }
        }
        NodeKind::Travel { distance } => (own.min(*distance), *distance),
        NodeKind::Sneak { amount } | NodeKind::Connect { amount } => {
            let required = f64::from(*amount);
            (own.min(required), required)
        }
        #[allow(clippy::cast_precision_loss)]
        NodeKind::Timer { ticks, .. } => (own.min(*ticks as f64), *ticks as f64),
        _ => (0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn per_target_progress_caps_each_goal() {
        let at = NodeRef::new("main", "hunt");
        let mut progress = QuestProgress::new(&at, Utc::now());
        progress.add_counter(&at.goal_key("wolf"), 5.0);
        progress.add_counter(&at.goal_key("bear"), 1.0);
        let goal = CountObjective {
            targets: vec!["wolf".into(), "bear".into()],
            amount: 2,
            per_target: true,
        };
        assert_eq!(measure(&NodeKind::EntityKill(goal), &at, &progress), (3.0, 4.0));
    }

    #[test]
    fn timer_and_unknown_measures() {
        let at = NodeRef::new("main", "wait");
        let mut progress = QuestProgress::new(&at, Utc::now());
        progress.add_counter(&at.counter_key(), 40.0);
        let timer = NodeKind::Timer { ticks: 100, reminder: None };
        assert_eq!(measure(&timer, &at, &progress), (40.0, 100.0));
        assert_eq!(measure(&NodeKind::Objective, &at, &progress), (0.0, 1.0));
    }
}
