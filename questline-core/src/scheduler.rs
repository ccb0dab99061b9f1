//! Tick-based delayed continuations.
//!
//! Every delay, timer and deferred step is a task owned by a player and a
//! quest, so stopping a quest or disconnecting a player can cancel exactly
//! its own tasks and nothing else.

use std::collections::{BTreeMap, HashMap};

use crate::types::{PlayerId, QuestId, Tick};

/// Handle of a scheduled task.
pub type TaskId = u64;

/// What a task does when it comes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Execute the node the branch cursor points at.
    Run,
    /// Continue an instruction list at `index`.
    Resume {
        /// Node id holding the list.
        node: String,
        /// Instruction index.
        index: usize,
    },
    /// A timer objective elapsed `ticks` more.
    Timer {
        /// Timer node id.
        node: String,
        /// Ticks covered by this chunk.
        ticks: u64,
    },
}

/// A continuation owned by a player's quest branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Owner.
    pub player: PlayerId,
    /// Quest.
    pub quest: QuestId,
    /// Branch within the quest.
    pub branch: String,
    /// Work to do.
    pub action: TaskAction,
}

/// Ordered task queue with per-player indexing.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<(Tick, TaskId), Task>,
    index: HashMap<TaskId, Tick>,
    next_id: TaskId,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to run at tick `due`.
    pub fn schedule(&mut self, due: Tick, task: Task) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        self.queue.insert((due, id), task);
        self.index.insert(id, due);
        id
    }

    /// Cancel one task. Returns whether it was pending.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.index.remove(&id) {
            Some(due) => self.queue.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    /// Cancel every task matching `pred`; returns how many were removed.
    fn cancel_where(&mut self, pred: impl Fn(&Task) -> bool) -> usize {
        let doomed: Vec<(Tick, TaskId)> = self
            .queue
            .iter()
            .filter(|(_, t)| pred(t))
            .map(|(k, _)| *k)
            .collect();
        for key in &doomed {
            self.queue.remove(key);
            self.index.remove(&key.1);
        }
        doomed.len()
    }

    /// Cancel every task of a player.
    pub fn cancel_player(&mut self, player: PlayerId) -> usize {
        self.cancel_where(|t| t.player == player)
    }

    /// Cancel every task of one quest of a player.
    pub fn cancel_quest(&mut self, player: PlayerId, quest: &QuestId) -> usize {
        self.cancel_where(|t| t.player == player && &t.quest == quest)
    }

    /// Cancel every task of one branch of a quest.
    pub fn cancel_branch(&mut self, player: PlayerId, quest: &QuestId, branch: &str) -> usize {
        self.cancel_where(|t| t.player == player && &t.quest == quest && t.branch == branch)
    }

    /// Ticks from `now` until the earliest run or resume task of a branch.
    #[must_use]
    pub fn next_run_in(&self, player: PlayerId, quest: &QuestId, branch: &str, now: Tick) -> Option<Tick> {
        self.queue
            .iter()
            .find(|(_, t)| {
                t.player == player
                    && &t.quest == quest
                    && t.branch == branch
                    && matches!(t.action, TaskAction::Run | TaskAction::Resume { .. })
            })
            .map(|((due, _), _)| due.saturating_sub(now))
    }

    /// Remove and return tasks due at or before `now`, in due order.
    pub fn take_due(&mut self, now: Tick) -> Vec<Task> {
        let later = self.queue.split_off(&(now.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.queue, later);
        due.into_iter()
            .map(|((_, id), task)| {
                self.index.remove(&id);
                task
            })
            .collect()
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Number of pending tasks of a player.
    #[must_use]
    pub fn pending_for(&self, player: PlayerId) -> usize {
        self.queue.values().filter(|t| t.player == player).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(player: PlayerId, quest: &str) -> Task {
        Task {
            player,
            quest: quest.into(),
            branch: "main".into(),
            action: TaskAction::Run,
        }
    }

    #[test]
    fn due_tasks_come_out_in_order() {
        let mut s = Scheduler::new();
        let p = PlayerId::new();
        s.schedule(5, task(p, "b"));
        s.schedule(3, task(p, "a"));
        s.schedule(9, task(p, "c"));
        let due = s.take_due(5);
        assert_eq!(due.iter().map(|t| t.quest.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn cancellation_is_scoped() {
        let mut s = Scheduler::new();
        let (p1, p2) = (PlayerId::new(), PlayerId::new());
        let id = s.schedule(1, task(p1, "q"));
        s.schedule(1, task(p1, "r"));
        s.schedule(1, task(p2, "q"));
        assert_eq!(s.cancel_quest(p1, &"q".into()), 1);
        assert!(!s.cancel(id), "already cancelled");
        assert_eq!(s.pending_for(p1), 1);
        assert_eq!(s.cancel_player(p2), 1);
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn next_run_skips_timers_and_other_branches() {
        let mut s = Scheduler::new();
        let p = PlayerId::new();
        let quest: QuestId = "q".into();
        s.schedule(
            4,
            Task {
                action: TaskAction::Timer {
                    node: "t".into(),
                    ticks: 4,
                },
                ..task(p, "q")
            },
        );
        s.schedule(
            6,
            Task {
                branch: "side".into(),
                ..task(p, "q")
            },
        );
        assert_eq!(s.next_run_in(p, &quest, "main", 2), None);
        s.schedule(
            12,
            Task {
                action: TaskAction::Resume {
                    node: "n".into(),
                    index: 2,
                },
                ..task(p, "q")
            },
        );
        assert_eq!(s.next_run_in(p, &quest, "main", 2), Some(10));
        assert_eq!(s.next_run_in(p, &quest, "side", 2), Some(4));
    }
}
