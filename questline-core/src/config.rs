//! Configuration for the Questline engine.
//!
//! Maps directly to `questline.toml`. Every field has a serde default so a
//! partial file (or an empty one) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level Questline configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuestlineConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Script interpreter tuning.
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    /// Player state cache behaviour.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Persistence / save settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Effect micro-VM budgets.
    #[serde(default)]
    pub effects: EffectsConfig,
    /// Pool / token bookkeeping.
    #[serde(default)]
    pub pools: PoolConfig,
}

impl QuestlineConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `QuestError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> crate::error::Result<Self> {
        toml::from_str(toml_str).map_err(|e| crate::QuestError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the quest system is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum concurrently active quests per player (0 = unlimited).
    #[serde(default)]
    pub max_active: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
            max_active: 0,
        }
    }
}

/// Script interpreter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Node executions allowed per session per tick before the rest is
    /// deferred to the next tick. Breaks zero-delay goto cycles.
    #[serde(default = "default_64_u32")]
    pub max_steps_per_tick: u32,
    /// Capacity of the per-quest avoid-repeat history.
    #[serde(default = "default_32_usize")]
    pub history_limit: usize,
    /// Goto prefix that ends the quest with an outcome (`end:success`).
    #[serde(default = "default_outcome_prefix")]
    pub outcome_prefix: String,
    /// Outcomes that count as a successful completion.
    #[serde(default = "default_success_outcomes")]
    pub success_outcomes: Vec<String>,
    /// Visible choices per dialog menu page.
    #[serde(default = "default_6_usize")]
    pub menu_page_size: usize,
    /// Branch used when a definition does not name one.
    #[serde(default = "default_start_branch")]
    pub start_branch: String,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_steps_per_tick: 64,
            history_limit: 32,
            outcome_prefix: "end:".to_string(),
            success_outcomes: default_success_outcomes(),
            menu_page_size: 6,
            start_branch: "main".to_string(),
        }
    }
}

/// Player state cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Ticks between flush scans of dirty entries.
    #[serde(default = "default_100_u64")]
    pub flush_interval_ticks: u64,
    /// Seconds a clean, idle entry survives before eviction.
    #[serde(default = "default_300_i64")]
    pub idle_ttl_secs: i64,
    /// Ticks between eviction scans.
    #[serde(default = "default_1200_u64")]
    pub eviction_interval_ticks: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_interval_ticks: 100,
            idle_ttl_secs: 300,
            eviction_interval_ticks: 1200,
        }
    }
}

/// Persistence / save settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// Number of save backups to keep.
    #[serde(default = "default_3")]
    pub backup_count: u32,
    /// Detect save corruption via checksums.
    #[serde(default = "default_true")]
    pub checksum_enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: "questline.db".to_string(),
            wal_mode: true,
            backup_count: 3,
            checksum_enabled: true,
        }
    }
}

/// Effect micro-VM budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectsConfig {
    /// Instructions executed per tick across all runs.
    #[serde(default = "default_2048_u32")]
    pub global_budget: u32,
    /// Instructions a single run may execute per tick.
    #[serde(default = "default_128_u32")]
    pub per_run_budget: u32,
    /// Compiled scripts kept in the LRU cache.
    #[serde(default = "default_64_usize")]
    pub script_cache_size: usize,
    /// Concurrent runs allowed per player (0 = unlimited).
    #[serde(default = "default_8_usize")]
    pub max_runs_per_player: usize,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            global_budget: 2048,
            per_run_budget: 128,
            script_cache_size: 64,
            max_runs_per_player: 8,
        }
    }
}

/// Pool / token bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Length of one streak window in seconds (default: one day).
    #[serde(default = "default_86400_i64")]
    pub window_secs: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { window_secs: 86_400 }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde requires named functions)
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_outcome_prefix() -> String { "end:".to_string() }
fn default_start_branch() -> String { "main".to_string() }
fn default_db_path() -> String { "questline.db".to_string() }
fn default_success_outcomes() -> Vec<String> { vec!["success".to_string(), "complete".to_string()] }
fn default_3() -> u32 { 3 }
fn default_64_u32() -> u32 { 64 }
fn default_128_u32() -> u32 { 128 }
fn default_2048_u32() -> u32 { 2048 }
fn default_6_usize() -> usize { 6 }
fn default_8_usize() -> usize { 8 }
fn default_32_usize() -> usize { 32 }
fn default_64_usize() -> usize { 64 }
fn default_100_u64() -> u64 { 100 }
fn default_1200_u64() -> u64 { 1200 }
fn default_300_i64() -> i64 { 300 }
fn default_86400_i64() -> i64 { 86_400 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = QuestlineConfig::default();
        assert!(config.general.enabled);
        assert_eq!(config.interpreter.outcome_prefix, "end:");
        assert_eq!(config.cache.flush_interval_ticks, 100);
        assert!(config.persistence.wal_mode);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = QuestlineConfig::from_toml("").expect("parse");
        assert_eq!(config.interpreter.history_limit, 32);
        assert_eq!(config.effects.per_run_budget, 128);
    }

    #[test]
    fn partial_toml_overrides() {
        let config = QuestlineConfig::from_toml(
            r#"
            [interpreter]
            history_limit = 4
            success_outcomes = ["win"]

            [cache]
            idle_ttl_secs = 10
            "#,
        )
        .expect("parse");
        assert_eq!(config.interpreter.history_limit, 4);
        assert_eq!(config.interpreter.success_outcomes, vec!["win".to_string()]);
        assert_eq!(config.interpreter.max_steps_per_tick, 64);
        assert_eq!(config.cache.idle_ttl_secs, 10);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = QuestlineConfig::from_toml("[cache\n").expect_err("should fail");
        assert!(matches!(err, crate::QuestError::Config(_)));
    }
}
