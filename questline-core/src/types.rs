//! Core type definitions shared by every Questline module.
//!
//! Identity values are plain data so that callers never have to hand the
//! engine host-specific object types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Unique identifier for a connected participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Create a new random player ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a quest definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestId(pub String);

impl QuestId {
    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QuestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QuestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for QuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully qualified position of a node inside a quest: `branch:node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    /// Branch id.
    pub branch: String,
    /// Node id within the branch.
    pub node: String,
}

impl NodeRef {
    /// Create a reference from its parts.
    #[must_use]
    pub fn new(branch: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            node: node.into(),
        }
    }

    /// Key used for per-node progress counters: `branch:node`.
    #[must_use]
    pub fn counter_key(&self) -> String {
        format!("{}:{}", self.branch, self.node)
    }

    /// Key used for per-goal progress counters: `branch:node:goal`.
    #[must_use]
    pub fn goal_key(&self, goal: &str) -> String {
        format!("{}:{}:{goal}", self.branch, self.node)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.branch, self.node)
    }
}

/// Game time, measured in simulation ticks.
pub type Tick = u64;

// ---------------------------------------------------------------------------
// Spatial
// ---------------------------------------------------------------------------

/// A position in a named world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// World name.
    #[serde(default)]
    pub world: String,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl Location {
    /// Create a location in the given world.
    #[must_use]
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    /// Euclidean distance, or `None` across worlds.
    #[must_use]
    pub fn distance(&self, other: &Self) -> Option<f64> {
        if self.world != other.world {
            return None;
        }
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        Some((dx * dx + dy * dy + dz * dz).sqrt())
    }
}

impl Default for Location {
    fn default() -> Self {
        Self {
            world: "world".to_string(),
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:.1}, {:.1}, {:.1})", self.world, self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// Wall clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time (cooldowns, pool windows, cache idleness).
pub trait Clock {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always returns a fixed point in time, adjustable in tests.
#[derive(Debug, Clone)]
pub struct FixedClock(pub std::rc::Rc<std::cell::Cell<DateTime<Utc>>>);

impl FixedClock {
    /// Create a clock pinned at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(std::rc::Rc::new(std::cell::Cell::new(at)))
    }

    /// Move the clock forward by `secs` seconds. Clones share the same time.
    pub fn advance_secs(&self, secs: i64) {
        self.0.set(self.0.get() + chrono::Duration::seconds(secs));
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ref_keys() {
        let r = NodeRef::new("main", "n1");
        assert_eq!(r.counter_key(), "main:n1");
        assert_eq!(r.goal_key("zombie"), "main:n1:zombie");
        assert_eq!(r.to_string(), "main:n1");
    }

    #[test]
    fn distance_is_none_across_worlds() {
        let a = Location::new("world", 0.0, 0.0, 0.0);
        let b = Location::new("nether", 1.0, 0.0, 0.0);
        assert!(a.distance(&b).is_none());
        let c = Location::new("world", 3.0, 4.0, 0.0);
        assert!((a.distance(&c).unwrap_or_default() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fixed_clock_clones_share_time() {
        let clock = FixedClock::new(Utc::now());
        let other = clock.clone();
        let before = other.now();
        clock.advance_secs(60);
        assert_eq!((other.now() - before).num_seconds(), 60);
    }
}
