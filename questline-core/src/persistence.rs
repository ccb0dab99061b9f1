//! Player state storage.
//!
//! [`PlayerStore`] is the seam between the cache / write-behind worker and
//! durable storage. [`SqliteStore`] is the production backend:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS players (
//!     player_id  TEXT PRIMARY KEY,
//!     data       BLOB NOT NULL,      -- JSON PlayerState
//!     version    INTEGER NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     checksum   TEXT
//! );
//! CREATE TABLE IF NOT EXISTS server_vars (
//!     key        TEXT PRIMARY KEY,
//!     value      TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS quest_definitions (
//!     quest_id   TEXT PRIMARY KEY,
//!     data       BLOB NOT NULL,      -- MessagePack QuestDefinition
//!     updated_at TEXT NOT NULL
//! );
//! ```
//!
//! - WAL mode so the simulation thread can read while the worker writes.
//! - JSON inside a BLOB keeps the schema stable as `PlayerState` grows.
//! - Optional CRC-32 checksum detects save corruption.
//! - Backups through SQLite's online-backup API.
//!
//! [`MemoryStore`] is a shared in-memory backend for tests and embedders
//! that do not want a database.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::definition::QuestDefinition;
use crate::error::{QuestError, Result};
use crate::state::PlayerState;
use crate::types::PlayerId;

// ---------------------------------------------------------------------------
// PlayerStore
// ---------------------------------------------------------------------------

/// Durable storage for player state and server variables.
///
/// Implementations are moved onto the persistence worker thread, hence `Send`.
pub trait PlayerStore: Send {
    /// Load a player's state; `None` for a player never saved.
    ///
    /// # Errors
    /// Storage or decoding failures.
    fn load_player(&self, player: PlayerId) -> Result<Option<PlayerState>>;

    /// Upsert a player's state snapshot taken at `version`.
    ///
    /// # Errors
    /// Storage or encoding failures.
    fn save_player(&self, state: &PlayerState, version: u64) -> Result<()>;

    /// Load every server variable.
    ///
    /// # Errors
    /// Storage failures.
    fn load_server_vars(&self) -> Result<BTreeMap<String, String>>;

    /// Upsert (`Some`) or delete (`None`) one server variable.
    ///
    /// # Errors
    /// Storage failures.
    fn save_server_var(&self, key: &str, value: Option<&str>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// CRC-32 checksum helper
// ---------------------------------------------------------------------------

fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32_compute(data))
}

/// CRC-32 (ISO 3309 / ITU-T V.42).
fn crc32_compute(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS players (
        player_id  TEXT PRIMARY KEY,
        data       BLOB NOT NULL,
        version    INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        checksum   TEXT
    );
    CREATE TABLE IF NOT EXISTS server_vars (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS quest_definitions (
        quest_id   TEXT PRIMARY KEY,
        data       BLOB NOT NULL,
        updated_at TEXT NOT NULL
    );";

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// SQLite-backed [`PlayerStore`].
pub struct SqliteStore {
    conn: Connection,
    config: PersistenceConfig,
    db_path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema.
    ///
    /// # Errors
    /// Returns [`QuestError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&db_path, flags)?;
        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;

        info!(
            path = %db_path.display(),
            wal = config.wal_mode,
            "Questline store opened"
        );

        Ok(Self {
            conn,
            config: config.clone(),
            db_path,
        })
    }

    /// Open an in-memory database (single connection only).
    ///
    /// # Errors
    /// Returns [`QuestError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &PersistenceConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            config: config.clone(),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Open a second connection to the same file, for the worker thread.
    ///
    /// # Errors
    /// In-memory databases cannot be shared; SQLite failures otherwise.
    pub fn reopen(&self) -> Result<Self> {
        if self.is_in_memory() {
            return Err(QuestError::Config(
                "an in-memory store cannot be opened twice".to_string(),
            ));
        }
        Self::open(&self.db_path, &self.config)
    }

    fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }

    // ------------------------------------------------------------------
    // Definition cache
    // ------------------------------------------------------------------

    /// Upsert a definition's binary cache record (named MessagePack).
    ///
    /// # Errors
    /// Encoding or SQLite failures.
    pub fn save_definition(&self, def: &QuestDefinition) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(def).map_err(|e| QuestError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO quest_definitions (quest_id, data, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(quest_id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![def.id.as_str(), bytes, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load every cached definition. Undecodable records are skipped.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn load_definitions(&self) -> Result<Vec<QuestDefinition>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT quest_id, data FROM quest_definitions ORDER BY quest_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut defs = Vec::new();
        for row in rows {
            let (id, data) = row?;
            match rmp_serde::from_slice::<QuestDefinition>(&data) {
                Ok(def) => defs.push(def),
                Err(e) => warn!(quest = %id, error = %e, "Skipping undecodable cached definition"),
            }
        }
        Ok(defs)
    }

    /// Remove every cached definition (before re-caching a fresh load).
    ///
    /// # Errors
    /// SQLite failures.
    pub fn clear_definitions(&self) -> Result<()> {
        self.conn.execute("DELETE FROM quest_definitions", [])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Number of stored players.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn player_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM players", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Stored version of a player's row.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn stored_version(&self, player: PlayerId) -> Result<Option<u64>> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM players WHERE player_id = ?1",
                params![player.0.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| u64::try_from(v).unwrap_or(0)))
    }

    /// Copy the database to `dest_path` with SQLite's online-backup API.
    ///
    /// # Errors
    /// SQLite or I/O failures.
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let start = Instant::now();
        let mut dest = Connection::open(dest_path.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dest)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;
        info!(
            dest = %dest_path.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Database backup completed"
        );
        Ok(())
    }

    /// Create `<db>.bak.1`, shifting older backups up and keeping at most
    /// `backup_count`.
    ///
    /// # Errors
    /// SQLite or I/O failures.
    pub fn create_rotating_backup(&self) -> Result<()> {
        let max = self.config.backup_count;
        if self.is_in_memory() || max == 0 {
            return Ok(());
        }
        for i in (1..max).rev() {
            let src = self.backup_path(i);
            if src.exists() {
                std::fs::rename(&src, self.backup_path(i + 1))?;
            }
        }
        let oldest = self.backup_path(max + 1);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        self.backup(self.backup_path(1))?;
        info!(max_backups = max, "Rotating backup created");
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut p = self.db_path.clone();
        let ext = format!(
            "{}.bak.{n}",
            p.extension()
                .map_or(String::new(), |e| e.to_string_lossy().into_owned())
        );
        p.set_extension(ext);
        p
    }

    /// Database path (`:memory:` for in-memory stores).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `PRAGMA integrity_check`.
    ///
    /// # Errors
    /// If the check query itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }
}

impl PlayerStore for SqliteStore {
    fn load_player(&self, player: PlayerId) -> Result<Option<PlayerState>> {
        let start = Instant::now();
        let mut stmt = self
            .conn
            .prepare_cached("SELECT data, checksum FROM players WHERE player_id = ?1")?;
        let row: Option<(Vec<u8>, Option<String>)> = stmt
            .query_row(params![player.0.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let Some((data, stored_checksum)) = row else {
            return Ok(None);
        };

        if self.config.checksum_enabled {
            if let Some(ref expected) = stored_checksum {
                let actual = crc32_hex(&data);
                if *expected != actual {
                    warn!(
                        %player,
                        expected = %expected,
                        actual = %actual,
                        "Checksum mismatch; possible save corruption"
                    );
                }
            }
        }

        let state: PlayerState =
            serde_json::from_slice(&data).map_err(|e| QuestError::Serialization(e.to_string()))?;
        debug!(
            %player,
            active = state.active.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Loaded player state"
        );
        Ok(Some(state))
    }

    fn save_player(&self, state: &PlayerState, version: u64) -> Result<()> {
        let start = Instant::now();
        let json = serde_json::to_vec(state).map_err(|e| QuestError::Serialization(e.to_string()))?;
        let checksum = self.config.checksum_enabled.then(|| crc32_hex(&json));

        self.conn.execute(
            "INSERT INTO players (player_id, data, version, updated_at, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(player_id) DO UPDATE SET
                data = excluded.data,
                version = excluded.version,
                updated_at = excluded.updated_at,
                checksum = excluded.checksum",
            params![
                state.player.0.to_string(),
                json,
                i64::try_from(version).unwrap_or(i64::MAX),
                Utc::now().to_rfc3339(),
                checksum
            ],
        )?;

        debug!(
            player = %state.player,
            version,
            bytes = json.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Saved player state"
        );
        Ok(())
    }

    fn load_server_vars(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare_cached("SELECT key, value FROM server_vars")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut vars = BTreeMap::new();
        for row in rows {
            let (k, v) = row?;
            vars.insert(k, v);
        }
        Ok(vars)
    }

    fn save_server_var(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                self.conn.execute(
                    "INSERT INTO server_vars (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at",
                    params![key, value, Utc::now().to_rfc3339()],
                )?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM server_vars WHERE key = ?1", params![key])?;
            }
        }
        Ok(())
    }
}

/// Adds `.optional()` to `rusqlite::Result`, turning `QueryReturnedNoRows` into `Ok(None)`.
trait OptionalExt<T> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    players: HashMap<PlayerId, (PlayerState, u64)>,
    server: BTreeMap<String, String>,
    fail_next: usize,
    saves: u64,
}

/// In-memory [`PlayerStore`]. Clones share the same data, so a test can
/// hand one clone to the worker and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }

    /// Stored snapshot and version of a player.
    #[must_use]
    pub fn stored(&self, player: PlayerId) -> Option<(PlayerState, u64)> {
        self.inner.lock().players.get(&player).cloned()
    }

    /// Successful player saves so far.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.inner.lock().saves
    }

    /// Current server variables.
    #[must_use]
    pub fn server_vars(&self) -> BTreeMap<String, String> {
        self.inner.lock().server.clone()
    }
}

impl PlayerStore for MemoryStore {
    fn load_player(&self, player: PlayerId) -> Result<Option<PlayerState>> {
        Ok(self.inner.lock().players.get(&player).map(|(s, _)| s.clone()))
    }

    fn save_player(&self, state: &PlayerState, version: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(QuestError::Io(std::io::Error::other("injected save failure")));
        }
        inner.players.insert(state.player, (state.clone(), version));
        inner.saves += 1;
        Ok(())
    }

    fn load_server_vars(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.inner.lock().server.clone())
    }

    fn save_server_var(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        match value {
            Some(v) => inner.server.insert(key.to_string(), v.to_string()),
            None => inner.server.remove(key),
        };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::QuestProgress;
    use crate::types::NodeRef;

    fn test_config() -> PersistenceConfig {
        PersistenceConfig {
            checksum_enabled: true,
            ..PersistenceConfig::default()
        }
    }

    fn sample_state() -> PlayerState {
        let mut state = PlayerState::new(PlayerId::new());
        let mut progress = QuestProgress::new(&NodeRef::new("main", "n2"), Utc::now());
        progress.variables.insert("count".into(), "3".into());
        state.active.insert("intro".into(), progress);
        state.user_vars.insert("class".into(), "knight".into());
        state
    }

    #[test]
    fn round_trip_save_load() {
        let store = SqliteStore::open_in_memory(&test_config()).expect("open");
        let state = sample_state();
        store.save_player(&state, 7).expect("save");
        let loaded = store.load_player(state.player).expect("load").expect("Some");
        assert_eq!(loaded, state);
        assert_eq!(store.stored_version(state.player).expect("version"), Some(7));
    }

    #[test]
    fn load_unknown_player_returns_none() {
        let store = SqliteStore::open_in_memory(&test_config()).expect("open");
        assert!(store.load_player(PlayerId::new()).expect("load").is_none());
    }

    #[test]
    fn upsert_overwrites() {
        let store = SqliteStore::open_in_memory(&test_config()).expect("open");
        let mut state = sample_state();
        store.save_player(&state, 1).expect("save1");
        state.user_vars.insert("rank".into(), "2".into());
        store.save_player(&state, 2).expect("save2");
        let loaded = store.load_player(state.player).expect("load").expect("Some");
        assert_eq!(loaded.user_vars.get("rank").map(String::as_str), Some("2"));
        assert_eq!(store.player_count().expect("count"), 1);
    }

    #[test]
    fn server_vars_upsert_and_delete() {
        let store = SqliteStore::open_in_memory(&test_config()).expect("open");
        store.save_server_var("event", Some("on")).expect("set");
        store.save_server_var("event", Some("off")).expect("overwrite");
        store.save_server_var("gone", Some("x")).expect("set");
        store.save_server_var("gone", None).expect("delete");
        let vars = store.load_server_vars().expect("load");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("event").map(String::as_str), Some("off"));
    }

    #[test]
    fn checksum_mismatch_still_loads() {
        let store = SqliteStore::open_in_memory(&test_config()).expect("open");
        let state = sample_state();
        store.save_player(&state, 1).expect("save");
        store
            .conn
            .execute(
                "UPDATE players SET checksum = 'deadbeef' WHERE player_id = ?1",
                params![state.player.0.to_string()],
            )
            .expect("corrupt checksum");
        assert!(store.load_player(state.player).expect("load").is_some());
    }

    #[test]
    fn definition_cache_round_trip() {
        let store = SqliteStore::open_in_memory(&test_config()).expect("open");
        let def: QuestDefinition = serde_json::from_str(
            r#"{ "id": "intro", "branches": { "main": { "start": "a",
                 "nodes": { "a": { "type": "message", "text": "hi", "goto": "end:success" } } } } }"#,
        )
        .expect("parse");
        store.save_definition(&def).expect("save");
        let defs = store.load_definitions().expect("load");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id.as_str(), "intro");
        store.clear_definitions().expect("clear");
        assert!(store.load_definitions().expect("load").is_empty());
    }

    #[test]
    fn reopen_shares_file_and_rotates_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("world.db");
        let mut config = test_config();
        config.backup_count = 2;

        let store = SqliteStore::open(&db_path, &config).expect("open");
        let second = store.reopen().expect("reopen");
        let state = sample_state();
        second.save_player(&state, 1).expect("save via second handle");
        assert!(store.load_player(state.player).expect("load").is_some());

        store.create_rotating_backup().expect("backup 1");
        store.create_rotating_backup().expect("backup 2");
        store.create_rotating_backup().expect("backup 3");
        assert!(dir.path().join("world.db.bak.1").exists());
        assert!(dir.path().join("world.db.bak.2").exists());
        assert!(!dir.path().join("world.db.bak.3").exists());
        assert!(store.integrity_check().expect("check"));
    }

    #[test]
    fn in_memory_store_cannot_reopen() {
        let store = SqliteStore::open_in_memory(&test_config()).expect("open");
        assert!(store.reopen().is_err());
    }

    #[test]
    fn memory_store_injected_failures() {
        let store = MemoryStore::new();
        let state = sample_state();
        store.fail_next_saves(1);
        assert!(store.save_player(&state, 1).is_err());
        store.save_player(&state, 2).expect("second save");
        assert_eq!(store.stored(state.player).map(|(_, v)| v), Some(2));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(crc32_compute(b"123456789"), 0xCBF4_3926);
    }
}
