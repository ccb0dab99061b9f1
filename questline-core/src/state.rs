//! Per-player quest state: the unit the cache owns and the store persists.
//!
//! Everything here is plain serde data. The interpreter mutates it only
//! through [`crate::cache::PlayerCache::modify`], which is what keeps the
//! dirty/version bookkeeping honest.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{NodeRef, PlayerId, QuestId};

// ---------------------------------------------------------------------------
// PlayerState
// ---------------------------------------------------------------------------

/// All persistent quest data of one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Owner.
    pub player: PlayerId,
    /// Running quests and their progress.
    #[serde(default)]
    pub active: BTreeMap<QuestId, QuestProgress>,
    /// Completion counts per quest.
    #[serde(default)]
    pub completions: BTreeMap<QuestId, u32>,
    /// Last successful completion per quest (cooldowns).
    #[serde(default)]
    pub last_completed: BTreeMap<QuestId, DateTime<Utc>>,
    /// Player-scoped variables shared by every quest.
    #[serde(default)]
    pub user_vars: BTreeMap<String, String>,
    /// Token pools.
    #[serde(default)]
    pub pools: BTreeMap<String, PoolState>,
    /// Avoid-repeat history carried over from the last run of each quest.
    #[serde(default)]
    pub histories: BTreeMap<QuestId, VecDeque<String>>,
}

impl PlayerState {
    /// Fresh state for a player with no history.
    #[must_use]
    pub fn new(player: PlayerId) -> Self {
        Self {
            player,
            active: BTreeMap::new(),
            completions: BTreeMap::new(),
            last_completed: BTreeMap::new(),
            user_vars: BTreeMap::new(),
            pools: BTreeMap::new(),
            histories: BTreeMap::new(),
        }
    }

    /// Whether a quest is running.
    #[must_use]
    pub fn is_active(&self, quest: &QuestId) -> bool {
        self.active.contains_key(quest)
    }

    /// How often a quest has been completed.
    #[must_use]
    pub fn completion_count(&self, quest: &QuestId) -> u32 {
        self.completions.get(quest).copied().unwrap_or(0)
    }

    /// Whether a quest has been completed at least once.
    #[must_use]
    pub fn has_completed(&self, quest: &QuestId) -> bool {
        self.completion_count(quest) > 0
    }

    /// Record a successful completion at `now`.
    pub fn record_completion(&mut self, quest: &QuestId, now: DateTime<Utc>) {
        *self.completions.entry(quest.clone()).or_insert(0) += 1;
        self.last_completed.insert(quest.clone(), now);
    }

    /// The copy handed to persistence: quests that opted out of saving
    /// progress are left out.
    #[must_use]
    pub fn persistable(&self) -> Self {
        let mut copy = self.clone();
        copy.active.retain(|_, p| !p.ephemeral);
        copy
    }

    /// Grant pool tokens, updating the streak for the window containing `now`.
    pub fn grant_tokens(&mut self, pool: &str, amount: u32, now: DateTime<Utc>, window_secs: i64) {
        let window = now.timestamp().div_euclid(window_secs.max(1));
        let state = self.pools.entry(pool.to_string()).or_default();
        state.tokens += u64::from(amount);
        state.streak = match state.last_window {
            Some(last) if last == window => state.streak.max(1),
            Some(last) if last + 1 == window => state.streak + 1,
            _ => 1,
        };
        state.last_window = Some(window);
    }
}

/// Token pool bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    /// Token balance.
    pub tokens: u64,
    /// Consecutive windows with at least one grant.
    pub streak: u32,
    /// Index of the last window a grant landed in.
    #[serde(default)]
    pub last_window: Option<i64>,
}

// ---------------------------------------------------------------------------
// QuestProgress
// ---------------------------------------------------------------------------

/// Progress of one running quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestProgress {
    /// When the quest was started.
    pub started_at: DateTime<Utc>,
    /// One cursor per running branch.
    #[serde(default)]
    pub cursors: BTreeMap<String, Cursor>,
    /// Quest-scoped variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Objective counters keyed `branch:node` or `branch:node:goal`.
    #[serde(default)]
    pub counters: BTreeMap<String, f64>,
    /// Completed objective keys.
    #[serde(default)]
    pub objectives: BTreeSet<String>,
    /// Group bookkeeping keyed by the group's `branch:node`.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupState>,
    /// Recently visited tags and outcomes (avoid-repeat).
    #[serde(default)]
    pub history: VecDeque<String>,
    /// Kept only in memory.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
}

impl QuestProgress {
    /// Progress positioned at `start`.
    #[must_use]
    pub fn new(start: &NodeRef, now: DateTime<Utc>) -> Self {
        let mut cursors = BTreeMap::new();
        cursors.insert(start.branch.clone(), Cursor::at(&start.node));
        Self {
            started_at: now,
            cursors,
            variables: BTreeMap::new(),
            counters: BTreeMap::new(),
            objectives: BTreeSet::new(),
            groups: BTreeMap::new(),
            history: VecDeque::new(),
            ephemeral: false,
        }
    }

    /// Cursor position of a branch.
    #[must_use]
    pub fn position(&self, branch: &str) -> Option<NodeRef> {
        self.cursors
            .get(branch)
            .map(|c| NodeRef::new(branch, c.node.clone()))
    }

    /// Every cursor position.
    #[must_use]
    pub fn positions(&self) -> Vec<NodeRef> {
        self.cursors
            .iter()
            .map(|(b, c)| NodeRef::new(b.clone(), c.node.clone()))
            .collect()
    }

    /// Counter value (0 when unset).
    #[must_use]
    pub fn counter(&self, key: &str) -> f64 {
        self.counters.get(key).copied().unwrap_or(0.0)
    }

    /// Add to a counter and return the new value.
    pub fn add_counter(&mut self, key: &str, amount: f64) -> f64 {
        let value = self.counters.entry(key.to_string()).or_insert(0.0);
        *value += amount;
        *value
    }

    /// Drop counters belonging to a node (its key and every goal key).
    pub fn clear_counters(&mut self, at: &NodeRef) {
        let key = at.counter_key();
        let goal_prefix = format!("{key}:");
        self.counters
            .retain(|k, _| k != &key && !k.starts_with(&goal_prefix));
    }

    /// Append to the avoid-repeat history. Re-inserting refreshes an entry;
    /// the oldest entry is evicted past `limit`.
    pub fn remember(&mut self, entry: &str, limit: usize) {
        if limit == 0 {
            return;
        }
        self.history.retain(|e| e != entry);
        self.history.push_back(entry.to_string());
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Whether `entry` is in the history.
    #[must_use]
    pub fn remembers(&self, entry: &str) -> bool {
        self.history.iter().any(|e| e == entry)
    }
}

/// Where one branch of a quest currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Node id in the branch.
    pub node: String,
    /// Group (`node` id in this branch) the current node runs under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Instruction index to resume an interrupted instruction list at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<usize>,
    /// Ticks still to wait before the node (or its list at `resume_at`)
    /// runs. While set, the node has not been entered and ignores events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
}

impl Cursor {
    /// Cursor at `node` with no group and no resume point.
    #[must_use]
    pub fn at(node: &str) -> Self {
        Self {
            node: node.to_string(),
            group: None,
            resume_at: None,
            wait: None,
        }
    }
}

/// Bookkeeping for a running group node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    /// Children not yet finished.
    pub remaining: Vec<String>,
    /// Children finished.
    pub done: usize,
    /// Children that must finish.
    pub required: usize,
    /// Declared order instead of random.
    pub ordered: bool,
    /// Enclosing group of the group node itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl GroupState {
    /// Whether the threshold has been reached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done >= self.required || self.remaining.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn history_is_bounded_and_refreshing() {
        let mut p = QuestProgress::new(&NodeRef::new("main", "a"), Utc::now());
        p.remember("A", 2);
        p.remember("B", 2);
        p.remember("A", 2);
        p.remember("C", 2);
        assert!(!p.remembers("B"), "oldest evicted");
        assert!(p.remembers("A"));
        assert!(p.remembers("C"));
    }

    #[test]
    fn counters_clear_by_node() {
        let at = NodeRef::new("main", "kill");
        let mut p = QuestProgress::new(&at, Utc::now());
        p.add_counter(&at.counter_key(), 3.0);
        p.add_counter(&at.goal_key("zombie"), 1.0);
        p.add_counter("main:killer", 1.0);
        p.clear_counters(&at);
        assert_eq!(p.counters.len(), 1);
        assert!((p.counter("main:killer") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn streak_tracks_consecutive_windows() {
        let mut s = PlayerState::new(PlayerId::new());
        let day = 86_400;
        let t0 = Utc.timestamp_opt(10 * day, 0).single().expect("time");
        s.grant_tokens("daily", 1, t0, day);
        s.grant_tokens("daily", 1, t0 + chrono::Duration::hours(1), day);
        s.grant_tokens("daily", 2, t0 + chrono::Duration::days(1), day);
        assert_eq!(s.pools["daily"].streak, 2);
        assert_eq!(s.pools["daily"].tokens, 4);
        s.grant_tokens("daily", 1, t0 + chrono::Duration::days(5), day);
        assert_eq!(s.pools["daily"].streak, 1);
    }

    #[test]
    fn ephemeral_progress_is_not_persisted() {
        let mut s = PlayerState::new(PlayerId::new());
        let mut p = QuestProgress::new(&NodeRef::new("main", "a"), Utc::now());
        p.ephemeral = true;
        s.active.insert("temp".into(), p.clone());
        p.ephemeral = false;
        s.active.insert("kept".into(), p);
        let out = s.persistable();
        assert!(out.is_active(&"kept".into()));
        assert!(!out.is_active(&"temp".into()));
    }
}
