//! Runtime metrics & instrumentation.
//!
//! Lock-free `AtomicU64` counters are bumped on the simulation thread and
//! read by dashboards. Per-tick timings go into a ring buffer behind a
//! `parking_lot::Mutex`, which is only contended on rare reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Global Counters (lock-free)
// ---------------------------------------------------------------------------

/// Atomic counters for high-frequency engine events.
#[derive(Debug)]
pub struct QuestCounters {
    /// Sessions started (fresh or resumed).
    pub sessions_started: AtomicU64,
    /// Node handlers executed.
    pub nodes_executed: AtomicU64,
    /// Quests ended with a success outcome.
    pub quests_completed: AtomicU64,
    /// Quests ended with any other outcome or stopped.
    pub quests_ended: AtomicU64,
    /// Content errors degraded to no-ops.
    pub content_errors: AtomicU64,
    /// Snapshots handed to the persistence worker.
    pub saves_enqueued: AtomicU64,
    /// Writes acknowledged as durable.
    pub saves_completed: AtomicU64,
    /// Writes that failed and will be retried.
    pub save_failures: AtomicU64,
    /// Completions that arrived after a newer mutation (entry stays dirty).
    pub stale_completions: AtomicU64,
    /// Cache entries evicted.
    pub cache_evictions: AtomicU64,
}

impl QuestCounters {
    /// Create a new set of zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            nodes_executed: AtomicU64::new(0),
            quests_completed: AtomicU64::new(0),
            quests_ended: AtomicU64::new(0),
            content_errors: AtomicU64::new(0),
            saves_enqueued: AtomicU64::new(0),
            saves_completed: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
            stale_completions: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
        }
    }

    /// Increment one counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            nodes_executed: self.nodes_executed.load(Ordering::Relaxed),
            quests_completed: self.quests_completed.load(Ordering::Relaxed),
            quests_ended: self.quests_ended.load(Ordering::Relaxed),
            content_errors: self.content_errors.load(Ordering::Relaxed),
            saves_enqueued: self.saves_enqueued.load(Ordering::Relaxed),
            saves_completed: self.saves_completed.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for QuestCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of counter values at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Sessions started.
    pub sessions_started: u64,
    /// Node handlers executed.
    pub nodes_executed: u64,
    /// Quests completed successfully.
    pub quests_completed: u64,
    /// Quests ended otherwise.
    pub quests_ended: u64,
    /// Content errors.
    pub content_errors: u64,
    /// Snapshots enqueued.
    pub saves_enqueued: u64,
    /// Durable writes.
    pub saves_completed: u64,
    /// Failed writes.
    pub save_failures: u64,
    /// Stale completions.
    pub stale_completions: u64,
    /// Evictions.
    pub cache_evictions: u64,
}

impl CounterSnapshot {
    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let rows: [(&str, &str, u64); 10] = [
            ("sessions_started", "Quest sessions started", self.sessions_started),
            ("nodes_executed", "Script nodes executed", self.nodes_executed),
            ("quests_completed", "Quests completed successfully", self.quests_completed),
            ("quests_ended", "Quests ended without success", self.quests_ended),
            ("content_errors", "Content errors degraded to no-ops", self.content_errors),
            ("saves_enqueued", "Player snapshots enqueued for writing", self.saves_enqueued),
            ("saves_completed", "Player snapshots written", self.saves_completed),
            ("save_failures", "Player snapshot writes that failed", self.save_failures),
            ("stale_completions", "Write completions superseded by newer mutations", self.stale_completions),
            ("cache_evictions", "Idle cache entries evicted", self.cache_evictions),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!(
                "# HELP questline_{name}_total {help}\n\
                 # TYPE questline_{name}_total counter\n\
                 questline_{name}_total {value}\n"
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tick Budget Monitor
// ---------------------------------------------------------------------------

/// Tracks time spent per simulation tick inside the quest systems.
pub struct TickBudgetMonitor {
    budget_ms: f64,
    history: Mutex<TickHistory>,
}

struct TickHistory {
    timings: Vec<f64>,
    write_idx: usize,
    count: u64,
    last_over_budget: bool,
}

impl TickBudgetMonitor {
    /// Create a new monitor with the given budget (milliseconds).
    #[must_use]
    pub fn new(budget_ms: f64) -> Self {
        Self {
            budget_ms,
            history: Mutex::new(TickHistory {
                timings: vec![0.0; 256],
                write_idx: 0,
                count: 0,
                last_over_budget: false,
            }),
        }
    }

    /// Begin timing a tick. Returns a guard that records elapsed time on drop.
    pub fn begin_tick(&self) -> TickGuard<'_> {
        TickGuard {
            monitor: self,
            start: Instant::now(),
        }
    }

    /// Record a tick timing manually (milliseconds).
    pub fn record(&self, ms: f64) {
        let mut h = self.history.lock();
        let idx = h.write_idx;
        let len = h.timings.len();
        h.timings[idx] = ms;
        h.write_idx = (idx + 1) % len;
        h.count += 1;
        h.last_over_budget = ms > self.budget_ms;
    }

    /// Whether the last tick exceeded the budget.
    #[must_use]
    pub fn is_over_budget(&self) -> bool {
        self.history.lock().last_over_budget
    }

    /// Maximum timing currently held in the ring buffer.
    #[must_use]
    pub fn max_ms(&self) -> f64 {
        let h = self.history.lock();
        let n = (h.count as usize).min(h.timings.len());
        h.timings[..n].iter().copied().fold(0.0, f64::max)
    }

    /// Total number of ticks recorded.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.history.lock().count
    }

    /// The configured budget in milliseconds.
    #[must_use]
    pub fn budget_ms(&self) -> f64 {
        self.budget_ms
    }
}

/// RAII guard that records elapsed time when dropped.
pub struct TickGuard<'a> {
    monitor: &'a TickBudgetMonitor,
    start: Instant,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        let ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.monitor.record(ms);
    }
}

// ---------------------------------------------------------------------------
// Tracing Span Names
// ---------------------------------------------------------------------------

/// Span names used with `tracing::span!`.
pub mod spans {
    /// Top-level per-tick span.
    pub const TICK: &str = "questline::tick";
    /// A single node execution.
    pub const NODE: &str = "questline::node";
    /// Cache flush scan.
    pub const FLUSH: &str = "questline::cache::flush";
    /// Persistence worker write.
    pub const PERSIST_SAVE: &str = "questline::persist::save";
    /// Persistence load on first touch.
    pub const PERSIST_LOAD: &str = "questline::persist::load";
    /// Effect VM tick.
    pub const EFFECTS: &str = "questline::effects";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_snapshot() {
        let c = QuestCounters::new();
        QuestCounters::bump(&c.nodes_executed);
        QuestCounters::bump(&c.nodes_executed);
        QuestCounters::bump(&c.stale_completions);
        let snap = c.snapshot();
        assert_eq!(snap.nodes_executed, 2);
        assert_eq!(snap.stale_completions, 1);
        assert_eq!(snap.saves_completed, 0);
    }

    #[test]
    fn prometheus_format_valid() {
        let c = QuestCounters::new();
        c.saves_completed.fetch_add(42, Ordering::Relaxed);
        let prom = c.snapshot().to_prometheus();
        assert!(prom.contains("questline_saves_completed_total 42"));
        assert!(prom.contains("# TYPE"));
    }

    #[test]
    fn tick_monitor_detects_over_budget() {
        let monitor = TickBudgetMonitor::new(2.0);
        monitor.record(0.5);
        assert!(!monitor.is_over_budget());
        monitor.record(3.0);
        assert!(monitor.is_over_budget());
        assert_eq!(monitor.tick_count(), 2);
        assert!((monitor.max_ms() - 3.0).abs() < f64::EPSILON);
    }
}
