//! Server-side configuration.
//!
//! One TOML file carries both the engine sections (`[general]`,
//! `[interpreter]`, `[cache]`, ...) and a `[server]` table for the runtime
//! loop and content locations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use questline_core::{QuestError, QuestlineConfig, Result};

/// Engine configuration plus server runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Engine sections.
    #[serde(flatten)]
    pub core: QuestlineConfig,
    /// Runtime settings.
    #[serde(default)]
    pub server: ServerSettings,
}

/// `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Simulation ticks per second.
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    /// Directory holding `*.json` / `*.toml` quest definitions.
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: PathBuf,
    /// Cache loaded definitions in the database and fall back to them when
    /// the directory cannot be read.
    #[serde(default = "default_true")]
    pub use_definition_cache: bool,
    /// Optional effect library (TOML).
    #[serde(default)]
    pub effects_file: Option<PathBuf>,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            tick_rate: default_tick_rate(),
            definitions_dir: default_definitions_dir(),
            use_definition_cache: true,
            effects_file: None,
            json_logs: false,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML string.
    ///
    /// # Errors
    /// [`QuestError::Config`] on invalid TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| QuestError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// I/O or parse failures.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Wall-clock length of one tick.
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs(1) / self.server.tick_rate.max(1)
    }
}

fn default_true() -> bool {
    true
}

fn default_tick_rate() -> u32 {
    20
}

fn default_definitions_dir() -> PathBuf {
    PathBuf::from("quests")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ServerConfig::from_toml("").expect("empty config");
        assert_eq!(config.server.tick_rate, 20);
        assert_eq!(config.tick_duration(), Duration::from_millis(50));
        assert_eq!(config.core.interpreter.start_branch, "main");
        assert!(config.server.use_definition_cache);
    }

    #[test]
    fn engine_and_server_sections_share_one_file() {
        let config = ServerConfig::from_toml(
            r#"
            [general]
            log_level = "debug"

            [cache]
            flush_interval_ticks = 10

            [server]
            tick_rate = 10
            definitions_dir = "content/quests"
            use_definition_cache = false
            "#,
        )
        .expect("config");
        assert_eq!(config.core.general.log_level, "debug");
        assert_eq!(config.core.cache.flush_interval_ticks, 10);
        assert_eq!(config.server.definitions_dir, PathBuf::from("content/quests"));
        assert!(!config.server.use_definition_cache);
        assert_eq!(config.tick_duration(), Duration::from_millis(100));
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        assert!(matches!(ServerConfig::from_toml("[server"), Err(QuestError::Config(_))));
    }
}
