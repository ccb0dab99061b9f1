//! The server-side quest runtime.
//!
//! [`QuestServer`] owns the engine, the persistence worker and the
//! definition cache, and runs the per-tick systems in a fixed order:
//!
//! | Step                | Frequency                         |
//! |---------------------|-----------------------------------|
//! | Interpreter + fx    | Every tick                        |
//! | Completion drain    | Every tick                        |
//! | Write-behind flush  | `cache.flush_interval_ticks`, or right after a checkpoint |
//! | Idle eviction       | `cache.eviction_interval_ticks`   |
//!
//! Shutdown submits every dirty entry, joins the worker and writes
//! whatever the worker could not through the engine's own store.

use std::time::Instant;

use tracing::{debug, info, info_span, warn};

use questline_core::definition::LoadReport;
use questline_core::metrics::{TickBudgetMonitor, spans};
use questline_core::persistence::SqliteStore;
use questline_core::types::Location;
use questline_core::writer::PersistencePipeline;
use questline_core::{Capabilities, Host, PlayerId, QuestEngine, QuestError, Result, WorldEvent};
use questline_fx::EffectVm;

use crate::config::ServerConfig;
use crate::content;
use crate::hooks::{self, MoveFilter};

/// Share of a tick the quest systems may use before a warning is logged.
const TICK_BUDGET_SHARE: f64 = 0.1;

/// Engine, persistence worker and content, driven tick by tick.
pub struct QuestServer {
    config: ServerConfig,
    engine: QuestEngine,
    pipeline: Option<PersistencePipeline>,
    definitions: Option<SqliteStore>,
    moves: MoveFilter,
    monitor: TickBudgetMonitor,
    ticks: u64,
}

impl std::fmt::Debug for QuestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuestServer")
            .field("ticks", &self.ticks)
            .field("engine", &self.engine)
            .field("pipeline", &self.pipeline)
            .field("budget_ms", &self.monitor.budget_ms())
            .finish_non_exhaustive()
    }
}

impl QuestServer {
    /// Open the database, load content and effects, and start the
    /// persistence worker.
    ///
    /// # Errors
    /// Database, content or effect-library failures.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let persistence = &config.core.persistence;
        let store = SqliteStore::open(&persistence.path, persistence)?;
        if persistence.checksum_enabled && !store.integrity_check()? {
            warn!(path = %persistence.path, "Database integrity check failed");
        }
        let writer = store.reopen()?;
        let definitions = if config.server.use_definition_cache {
            Some(store.reopen()?)
        } else {
            None
        };
        let loaded = content::load(&config.server.definitions_dir, definitions.as_ref())?;

        let caps = Capabilities {
            effects: Some(Box::new(effect_vm(&config)?)),
            ..Capabilities::default()
        };
        let engine = QuestEngine::new(config.core.clone(), Box::new(store), caps)?;
        let pipeline = PersistencePipeline::spawn(Box::new(writer))?;

        let mut server = Self::with_engine(config, engine, Some(pipeline));
        server.definitions = definitions;
        let report = server.engine.reload_definitions(loaded.definitions);
        for (quest, reason) in &report.rejected {
            warn!(%quest, %reason, "Quest definition rejected");
        }
        info!(quests = report.loaded, source = ?loaded.source, "Quest server ready");
        Ok(server)
    }

    /// Wrap an existing engine. Without a pipeline, flushes write
    /// synchronously through the engine's store.
    #[must_use]
    pub fn with_engine(config: ServerConfig, engine: QuestEngine, pipeline: Option<PersistencePipeline>) -> Self {
        let budget_ms = config.tick_duration().as_secs_f64() * 1000.0 * TICK_BUDGET_SHARE;
        Self {
            config,
            engine,
            pipeline,
            definitions: None,
            moves: MoveFilter::new(),
            monitor: TickBudgetMonitor::new(budget_ms),
            ticks: 0,
        }
    }

    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The engine, for queries.
    #[must_use]
    pub fn engine(&self) -> &QuestEngine {
        &self.engine
    }

    /// The engine, for direct control (start/stop quests, menus, prompts).
    pub fn engine_mut(&mut self) -> &mut QuestEngine {
        &mut self.engine
    }

    /// Tick timings.
    #[must_use]
    pub fn monitor(&self) -> &TickBudgetMonitor {
        &self.monitor
    }

    /// Ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Re-read the definitions directory (or the cache) and swap the
    /// registry.
    ///
    /// # Errors
    /// Content or database failures; the current definitions stay active.
    pub fn reload_content(&mut self) -> Result<LoadReport> {
        let loaded = content::load(&self.config.server.definitions_dir, self.definitions.as_ref())?;
        Ok(self.engine.reload_definitions(loaded.definitions))
    }

    // -----------------------------------------------------------------------
    // Per-tick systems
    // -----------------------------------------------------------------------

    /// Run one tick. Returns the number of interpreter tasks executed.
    pub fn tick(&mut self, host: &mut dyn Host) -> usize {
        let started = Instant::now();
        self.ticks += 1;

        let executed = self.engine.tick(host);
        self.drain_completions();

        let flush_every = self.config.core.cache.flush_interval_ticks;
        let evict_every = self.config.core.cache.eviction_interval_ticks;
        let checkpoint = self.engine.take_flush_request();
        if checkpoint || (flush_every > 0 && self.ticks % flush_every == 0) {
            self.flush();
        }
        if evict_every > 0 && self.ticks % evict_every == 0 {
            let evicted = self.engine.evict_idle();
            if evicted > 0 {
                debug!(evicted, "Idle players evicted");
            }
        }

        self.monitor.record(started.elapsed().as_secs_f64() * 1000.0);
        if self.monitor.is_over_budget() {
            warn!(tick = self.ticks, budget_ms = self.monitor.budget_ms(), "Quest tick over budget");
        }
        executed
    }

    /// Hand every dirty entry to the worker (or write synchronously when
    /// there is none). Returns the number of entries handed off.
    pub fn flush(&mut self) -> usize {
        let _span = info_span!(spans::FLUSH, tick = self.ticks).entered();
        let Some(pipeline) = self.pipeline.as_ref() else {
            return match self.engine.flush_sync() {
                Ok(written) => written,
                Err(e) => {
                    warn!(error = %e, "Synchronous flush failed; will retry");
                    0
                }
            };
        };
        let mut submitted = 0;
        for request in self.engine.collect_dirty() {
            match pipeline.try_submit(request) {
                Ok(()) => submitted += 1,
                Err(request) => {
                    warn!(target = ?request.target(), "Persistence worker unavailable; write deferred");
                    self.engine.abandon_write(&request);
                }
            }
        }
        submitted
    }

    fn drain_completions(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        for completion in pipeline.drain_completions() {
            self.engine.apply_completion(&completion);
        }
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    /// A player joined.
    ///
    /// # Errors
    /// When the player's state cannot be loaded.
    pub fn player_joined(&mut self, player: PlayerId, host: &mut dyn Host) -> Result<usize> {
        self.engine.on_connect(player, host)
    }

    /// A player left.
    pub fn player_left(&mut self, player: PlayerId, host: &mut dyn Host) {
        self.moves.forget(player);
        self.engine.on_disconnect(player, host);
    }

    /// A position update. Only block changes reach the engine.
    pub fn player_moved(&mut self, player: PlayerId, to: &Location, host: &mut dyn Host) -> usize {
        match self.moves.update(player, to) {
            Some(event) => self.engine.handle_event(player, &event, host),
            None => 0,
        }
    }

    /// A command line. Blocked commands are refused before objectives see
    /// them.
    ///
    /// # Errors
    /// [`QuestError::CommandRestricted`].
    pub fn player_command(&mut self, player: PlayerId, line: &str, host: &mut dyn Host) -> Result<usize> {
        let event = hooks::on_command(line);
        if let WorldEvent::Command { command } = &event {
            self.engine.check_command(player, command)?;
        }
        Ok(self.engine.handle_event(player, &event, host))
    }

    /// Any other world event.
    pub fn dispatch(&mut self, player: PlayerId, event: &WorldEvent, host: &mut dyn Host) -> usize {
        self.engine.handle_event(player, event, host)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Flush everything and stop the worker. Returns the number of entries
    /// that reached the store.
    ///
    /// # Errors
    /// The first store error from the final synchronous pass.
    pub fn shutdown(&mut self) -> Result<usize> {
        let mut written = 0;
        if let Some(mut pipeline) = self.pipeline.take() {
            for request in self.engine.collect_dirty() {
                if let Err(request) = pipeline.try_submit(request) {
                    self.engine.abandon_write(&request);
                }
            }
            for completion in pipeline.shutdown() {
                if completion.ok {
                    written += 1;
                }
                self.engine.apply_completion(&completion);
            }
        }
        written += self.engine.flush_sync()?;
        if let Some(store) = self.definitions.as_ref() {
            if self.config.core.persistence.backup_count > 0 {
                if let Err(e) = store.create_rotating_backup() {
                    warn!(error = %e, "Shutdown backup failed");
                }
            }
        }
        info!(written, ticks = self.ticks, "Quest server stopped");
        Ok(written)
    }
}

fn effect_vm(config: &ServerConfig) -> Result<EffectVm> {
    let mut vm = EffectVm::new(config.core.effects.clone());
    if let Some(path) = &config.server.effects_file {
        let text = std::fs::read_to_string(path)?;
        let count = vm
            .load_library(&text)
            .map_err(|e| QuestError::Config(e.to_string()))?;
        info!(path = %path.display(), count, "Effect library loaded");
    }
    Ok(vm)
}
