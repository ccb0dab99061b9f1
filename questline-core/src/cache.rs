//! Player state cache with dirty tracking for write-behind persistence.
//!
//! The simulation thread owns the cache. Every mutation bumps the entry's
//! version and marks it dirty. A flush hands an owned snapshot (plus the
//! version it was taken at) to the persistence worker; when the worker
//! reports back, the entry is only marked clean if no mutation happened in
//! between. A write that raced a newer mutation therefore leaves the entry
//! dirty and it is written again on the next flush.
//!
//! At most one write per entry is in flight at a time, so completions can
//! never arrive out of order for the same key.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, info_span, warn};

use crate::error::Result;
use crate::metrics::spans;
use crate::persistence::PlayerStore;
use crate::state::PlayerState;
use crate::types::PlayerId;

// ---------------------------------------------------------------------------
// Write messages
// ---------------------------------------------------------------------------

/// A snapshot handed to the persistence worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// Upsert a player's state.
    Player {
        /// Snapshot.
        state: PlayerState,
        /// Entry version the snapshot was taken at.
        version: u64,
    },
    /// Upsert or delete a server variable.
    ServerVar {
        /// Key.
        key: String,
        /// New value; `None` deletes.
        value: Option<String>,
        /// Entry version the value was taken at.
        version: u64,
    },
}

impl WriteRequest {
    /// The key this request writes.
    #[must_use]
    pub fn target(&self) -> WriteTarget {
        match self {
            Self::Player { state, .. } => WriteTarget::Player(state.player),
            Self::ServerVar { key, .. } => WriteTarget::ServerVar(key.clone()),
        }
    }

    /// The version the request carries.
    #[must_use]
    pub fn version(&self) -> u64 {
        match self {
            Self::Player { version, .. } | Self::ServerVar { version, .. } => *version,
        }
    }
}

/// Key of a write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    /// A player row.
    Player(PlayerId),
    /// A server variable row.
    ServerVar(String),
}

/// The worker's report on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCompletion {
    /// Key written.
    pub target: WriteTarget,
    /// Version of the snapshot written.
    pub version: u64,
    /// Whether the write is durable.
    pub ok: bool,
}

/// What [`PlayerCache::complete`] did with a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Entry is clean.
    Clean,
    /// A newer mutation happened; entry stays dirty.
    Stale,
    /// The write failed; entry stays dirty for retry.
    Failed,
    /// Nothing was waiting for this completion.
    Ignored,
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry {
    state: PlayerState,
    dirty: bool,
    version: u64,
    in_flight: Option<u64>,
    last_access: DateTime<Utc>,
    online: bool,
}

#[derive(Debug, Default)]
struct VarEntry {
    dirty: bool,
    version: u64,
    in_flight: Option<u64>,
}

/// Server-wide variables with their own dirty tracking.
#[derive(Debug, Default)]
pub struct ServerVariables {
    values: BTreeMap<String, String>,
    entries: HashMap<String, VarEntry>,
}

impl ServerVariables {
    /// Read a variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// All variables.
    #[must_use]
    pub fn all(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

// ---------------------------------------------------------------------------
// PlayerCache
// ---------------------------------------------------------------------------

/// Authoritative in-memory copy of player state.
pub struct PlayerCache {
    entries: HashMap<PlayerId, CacheEntry>,
    server: ServerVariables,
    loader: Box<dyn PlayerStore>,
    idle_ttl: Duration,
}

impl std::fmt::Debug for PlayerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerCache")
            .field("entries", &self.entries.len())
            .field("server_vars", &self.server.values.len())
            .field("idle_ttl", &self.idle_ttl)
            .finish_non_exhaustive()
    }
}

impl PlayerCache {
    /// Create a cache that loads through `loader` and seed server variables from it.
    ///
    /// # Errors
    /// When server variables cannot be loaded.
    pub fn new(loader: Box<dyn PlayerStore>, idle_ttl_secs: i64) -> Result<Self> {
        let values = loader.load_server_vars()?;
        info!(server_vars = values.len(), "Player cache ready");
        Ok(Self {
            entries: HashMap::new(),
            server: ServerVariables {
                values,
                entries: HashMap::new(),
            },
            loader,
            idle_ttl: Duration::seconds(idle_ttl_secs),
        })
    }

    fn ensure(&mut self, player: PlayerId, now: DateTime<Utc>) -> Result<&mut CacheEntry> {
        let entry = match self.entries.entry(player) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let _span = info_span!(spans::PERSIST_LOAD, %player).entered();
                let state = self
                    .loader
                    .load_player(player)?
                    .unwrap_or_else(|| PlayerState::new(player));
                debug!(%player, active = state.active.len(), "Player state cached");
                slot.insert(CacheEntry {
                    state,
                    dirty: false,
                    version: 0,
                    in_flight: None,
                    last_access: now,
                    online: false,
                })
            }
        };
        entry.last_access = now;
        Ok(entry)
    }

    /// Read a player's state, loading it synchronously on first touch.
    ///
    /// # Errors
    /// When the store cannot load the player.
    pub fn get(&mut self, player: PlayerId, now: DateTime<Utc>) -> Result<&PlayerState> {
        Ok(&self.ensure(player, now)?.state)
    }

    /// Cached state without loading.
    #[must_use]
    pub fn peek(&self, player: PlayerId) -> Option<&PlayerState> {
        self.entries.get(&player).map(|e| &e.state)
    }

    /// Mutable access; marks the entry dirty and bumps its version.
    ///
    /// # Errors
    /// When the store cannot load the player.
    pub fn state_mut(&mut self, player: PlayerId, now: DateTime<Utc>) -> Result<&mut PlayerState> {
        let entry = self.ensure(player, now)?;
        entry.dirty = true;
        entry.version += 1;
        Ok(&mut entry.state)
    }

    /// Apply `f` to a player's state as one mutation.
    ///
    /// # Errors
    /// When the store cannot load the player.
    pub fn modify<R>(
        &mut self,
        player: PlayerId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut PlayerState) -> R,
    ) -> Result<R> {
        Ok(f(self.state_mut(player, now)?))
    }

    /// Mark a player online (never evicted) or offline.
    ///
    /// # Errors
    /// When the store cannot load the player.
    pub fn set_online(&mut self, player: PlayerId, online: bool, now: DateTime<Utc>) -> Result<()> {
        self.ensure(player, now)?.online = online;
        Ok(())
    }

    /// Whether a player's entry has unsaved changes.
    #[must_use]
    pub fn is_dirty(&self, player: PlayerId) -> bool {
        self.entries.get(&player).is_some_and(|e| e.dirty)
    }

    /// Current version of a player's entry.
    #[must_use]
    pub fn version(&self, player: PlayerId) -> Option<u64> {
        self.entries.get(&player).map(|e| e.version)
    }

    /// Number of cached players.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no players are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ------------------------------------------------------------------
    // Server variables
    // ------------------------------------------------------------------

    /// Server variables.
    #[must_use]
    pub fn server(&self) -> &ServerVariables {
        &self.server
    }

    /// Set (`Some`) or delete (`None`) a server variable.
    pub fn set_server_var(&mut self, key: &str, value: Option<String>) {
        match value {
            Some(v) => self.server.values.insert(key.to_string(), v),
            None => self.server.values.remove(key),
        };
        let entry = self.server.entries.entry(key.to_string()).or_default();
        entry.dirty = true;
        entry.version += 1;
    }

    // ------------------------------------------------------------------
    // Write-behind
    // ------------------------------------------------------------------

    /// Snapshot every dirty entry with no write in flight, marking each in flight.
    pub fn collect_dirty(&mut self) -> Vec<WriteRequest> {
        let _span = info_span!(spans::FLUSH).entered();
        let mut out = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.dirty && entry.in_flight.is_none() {
                entry.in_flight = Some(entry.version);
                out.push(WriteRequest::Player {
                    state: entry.state.persistable(),
                    version: entry.version,
                });
            }
        }
        for (key, entry) in &mut self.server.entries {
            if entry.dirty && entry.in_flight.is_none() {
                entry.in_flight = Some(entry.version);
                out.push(WriteRequest::ServerVar {
                    key: key.clone(),
                    value: self.server.values.get(key).cloned(),
                    version: entry.version,
                });
            }
        }
        if !out.is_empty() {
            debug!(count = out.len(), "Collected dirty entries");
        }
        out
    }

    /// Apply a worker completion.
    pub fn complete(&mut self, completion: &WriteCompletion) -> CompletionOutcome {
        let (dirty, version, in_flight) = match &completion.target {
            WriteTarget::Player(id) => match self.entries.get_mut(id) {
                Some(e) => (&mut e.dirty, e.version, &mut e.in_flight),
                None => return CompletionOutcome::Ignored,
            },
            WriteTarget::ServerVar(key) => match self.server.entries.get_mut(key) {
                Some(e) => (&mut e.dirty, e.version, &mut e.in_flight),
                None => return CompletionOutcome::Ignored,
            },
        };
        if *in_flight != Some(completion.version) {
            return CompletionOutcome::Ignored;
        }
        *in_flight = None;
        if !completion.ok {
            warn!(target = ?completion.target, version = completion.version, "Write failed; will retry");
            return CompletionOutcome::Failed;
        }
        if version == completion.version {
            *dirty = false;
            CompletionOutcome::Clean
        } else {
            debug!(
                target = ?completion.target,
                written = completion.version,
                current = version,
                "Stale completion; entry stays dirty"
            );
            CompletionOutcome::Stale
        }
    }

    /// Put an unsubmitted request back (the worker refused it).
    pub fn abandon(&mut self, request: &WriteRequest) {
        let in_flight = match request.target() {
            WriteTarget::Player(id) => self.entries.get_mut(&id).map(|e| &mut e.in_flight),
            WriteTarget::ServerVar(key) => self.server.entries.get_mut(&key).map(|e| &mut e.in_flight),
        };
        if let Some(slot) = in_flight {
            if *slot == Some(request.version()) {
                *slot = None;
            }
        }
    }

    /// Evict offline entries that are clean, not in flight and idle past the TTL.
    /// Returns the number evicted.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.idle_ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            e.online || e.dirty || e.in_flight.is_some() || now - e.last_access < ttl
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted idle player entries");
        }
        evicted
    }

    /// Write every dirty entry synchronously through the loader store.
    /// Used at shutdown after the worker has drained.
    ///
    /// Every entry is attempted; a failed entry stays dirty for the next
    /// flush.
    ///
    /// # Errors
    /// The first storage failure, after all entries were attempted.
    pub fn flush_sync(&mut self) -> Result<usize> {
        let requests = self.collect_dirty();
        let mut written = 0;
        let mut failure = None;
        for request in requests {
            let result = match &request {
                WriteRequest::Player { state, version } => self.loader.save_player(state, *version),
                WriteRequest::ServerVar { key, value, .. } => {
                    self.loader.save_server_var(key, value.as_deref())
                }
            };
            let ok = result.is_ok();
            self.complete(&WriteCompletion {
                target: request.target(),
                version: request.version(),
                ok,
            });
            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}
