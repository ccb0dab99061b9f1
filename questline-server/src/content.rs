//! Quest content loading.
//!
//! Definitions live as one quest per `*.json` or `*.toml` file in the
//! configured directory. A successful directory load is mirrored into the
//! database's definition cache; when the directory cannot be read the
//! cached records are used instead, so a server can start from its last
//! good content.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use questline_core::persistence::SqliteStore;
use questline_core::{QuestDefinition, QuestError, Result};

/// Where a content load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    /// Files in the definitions directory.
    Directory,
    /// Records from the database definition cache.
    Cache,
}

/// Result of a content load.
#[derive(Debug)]
pub struct ContentLoad {
    /// Parsed definitions, sorted by file name.
    pub definitions: Vec<QuestDefinition>,
    /// Files that could not be parsed, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Origin of the definitions.
    pub source: ContentSource,
}

/// Parse one definition file by extension.
///
/// # Errors
/// I/O failures, unsupported extensions, or parse errors.
pub fn load_file(path: &Path) -> Result<QuestDefinition> {
    let text = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text).map_err(|e| QuestError::Serialization(e.to_string())),
        Some("toml") => toml::from_str(&text).map_err(|e| QuestError::Serialization(e.to_string())),
        _ => Err(QuestError::Config(format!("unsupported definition file {}", path.display()))),
    }
}

/// Parse every definition file in `dir`. Unparseable files are skipped and
/// reported; only an unreadable directory is an error.
///
/// # Errors
/// When the directory cannot be listed.
pub fn load_dir(dir: &Path) -> Result<ContentLoad> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml")))
        .collect();
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();
    for path in paths {
        match load_file(&path) {
            Ok(def) => definitions.push(def),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable quest file");
                skipped.push((path, e.to_string()));
            }
        }
    }
    Ok(ContentLoad {
        definitions,
        skipped,
        source: ContentSource::Directory,
    })
}

/// Load from `dir`, refreshing `cache` on success and falling back to it
/// when the directory is unavailable.
///
/// # Errors
/// The directory error when there is no cache to fall back to, or a
/// database error from the cache itself.
pub fn load(dir: &Path, cache: Option<&SqliteStore>) -> Result<ContentLoad> {
    match load_dir(dir) {
        Ok(loaded) => {
            if let Some(store) = cache {
                store.clear_definitions()?;
                for def in &loaded.definitions {
                    store.save_definition(def)?;
                }
            }
            info!(
                dir = %dir.display(),
                quests = loaded.definitions.len(),
                skipped = loaded.skipped.len(),
                "Quest content loaded"
            );
            Ok(loaded)
        }
        Err(e) => {
            let Some(store) = cache else {
                return Err(e);
            };
            warn!(dir = %dir.display(), error = %e, "Definitions directory unavailable; using cached definitions");
            let definitions = store.load_definitions()?;
            info!(quests = definitions.len(), "Quest content loaded from cache");
            Ok(ContentLoad {
                definitions,
                skipped: Vec::new(),
                source: ContentSource::Cache,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use questline_core::config::PersistenceConfig;

    const JSON_QUEST: &str = r#"{
        "id": "herbs",
        "branches": { "main": { "start": "a", "nodes": {
            "a": { "type": "message", "text": "Find herbs" }
        }}}
    }"#;

    const TOML_QUEST: &str = r#"
        id = "wolves"
        name = "Wolf Trouble"

        [branches.main]
        start = "hunt"

        [branches.main.nodes.hunt]
        type = "entity_kill"
        targets = ["wolf"]
        amount = 3
        goto = "end:success"
    "#;

    #[test]
    fn reads_both_formats_and_skips_bad_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a_herbs.json"), JSON_QUEST).expect("write");
        std::fs::write(dir.path().join("b_wolves.toml"), TOML_QUEST).expect("write");
        std::fs::write(dir.path().join("c_broken.json"), "{ not json").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let loaded = load_dir(dir.path()).expect("load");
        let ids: Vec<&str> = loaded.definitions.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["herbs", "wolves"]);
        assert_eq!(loaded.skipped.len(), 1);
        assert_eq!(loaded.source, ContentSource::Directory);
    }

    #[test]
    fn missing_directory_falls_back_to_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("herbs.json"), JSON_QUEST).expect("write");
        let store = SqliteStore::open_in_memory(&PersistenceConfig::default()).expect("store");

        let first = load(dir.path(), Some(&store)).expect("directory load");
        assert_eq!(first.source, ContentSource::Directory);

        let gone = dir.path().join("missing");
        let second = load(&gone, Some(&store)).expect("cache load");
        assert_eq!(second.source, ContentSource::Cache);
        assert_eq!(second.definitions.len(), 1);
        assert_eq!(second.definitions[0].id.as_str(), "herbs");

        assert!(load(&gone, None).is_err());
    }
}
