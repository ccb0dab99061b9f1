//! Quest script interpreter.
//!
//! [`QuestEngine`] owns the definition registry, the player state cache,
//! live sessions and the tick scheduler. Every entry point takes the
//! [`Host`] for the duration of the call; the engine never stores it.
//!
//! # Execution model
//!
//! A quest runs one cursor per branch. Executing a node either resolves
//! immediately (the cursor follows the node's goto), suspends (objective,
//! menu, prompt, timer or wait) or moves the cursor itself (groups). Work
//! that must happen later is a [`Task`] in the [`Scheduler`], and nothing
//! recurses across ticks, so a session can never block the tick loop.
//!
//! ```text
//! start_quest ──► Run task ──► execute node ──► resolve goto ──► next node
//!                    ▲               │                 │
//!                    │          suspend (event,        └──► end outcome
//!                    │          menu, prompt, wait)
//!                    └──── event / token / due task ◄──┘
//! ```

mod actions;
mod goto;
mod menu;
mod objectives;
mod requirements;
mod run;
mod scope;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::cache::{CompletionOutcome, PlayerCache, WriteCompletion, WriteRequest};
use crate::config::QuestlineConfig;
use crate::definition::{
    DefinitionRegistry, DefinitionSet, InteractKind, LoadReport, NodeKind, QuestDefinition, Target,
    VarScope,
};
use crate::error::{QuestError, Result};
use crate::events::WorldEvent;
use crate::host::{Capabilities, Host};
use crate::metrics::QuestCounters;
use crate::persistence::PlayerStore;
use crate::primitives;
use crate::scheduler::{Scheduler, Task, TaskAction};
use crate::state::{PlayerState, QuestProgress};
use crate::types::{Clock, NodeRef, PlayerId, QuestId, SystemClock, Tick};

use run::Entry;
use scope::Scope;
use session::Session;

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// Display detail of the objective a quest is currently waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveDetail {
    /// Where the cursor is.
    pub at: NodeRef,
    /// Interpolated objective text (empty when the node declares none).
    pub text: String,
    /// Progress so far.
    pub current: f64,
    /// Progress needed.
    pub required: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The quest runtime for one server.
pub struct QuestEngine {
    config: QuestlineConfig,
    registry: DefinitionRegistry,
    cache: PlayerCache,
    sessions: HashMap<(PlayerId, QuestId), Session>,
    scheduler: Scheduler,
    caps: Capabilities,
    rng: StdRng,
    clock: Box<dyn Clock>,
    counters: Arc<QuestCounters>,
    tokens: HashMap<u64, (PlayerId, QuestId)>,
    next_token: u64,
    now_tick: Tick,
    flush_requested: bool,
}

impl std::fmt::Debug for QuestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuestEngine")
            .field("tick", &self.now_tick)
            .field("definitions", &self.registry.len())
            .field("sessions", &self.sessions.len())
            .field("scheduled", &self.scheduler.pending_count())
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

impl QuestEngine {
    /// Create an engine. Server variables are loaded from `store` eagerly;
    /// players load lazily on first access.
    ///
    /// # Errors
    /// When server variables cannot be loaded.
    pub fn new(config: QuestlineConfig, store: Box<dyn PlayerStore>, caps: Capabilities) -> Result<Self> {
        let registry = DefinitionRegistry::new(
            config.interpreter.start_branch.clone(),
            config.interpreter.outcome_prefix.clone(),
        );
        let cache = PlayerCache::new(store, config.cache.idle_ttl_secs)?;
        Ok(Self {
            config,
            registry,
            cache,
            sessions: HashMap::new(),
            scheduler: Scheduler::new(),
            caps,
            rng: StdRng::from_entropy(),
            clock: Box::new(SystemClock),
            counters: Arc::new(QuestCounters::new()),
            tokens: HashMap::new(),
            next_token: 0,
            now_tick: 0,
            flush_requested: false,
        })
    }

    /// Replace the wall clock (cooldowns, pool windows, idle eviction).
    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed the random source used by random nodes, groups and chance conditions.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &QuestlineConfig {
        &self.config
    }

    /// Shared counters.
    #[must_use]
    pub fn counters(&self) -> Arc<QuestCounters> {
        Arc::clone(&self.counters)
    }

    /// Ticks processed so far.
    #[must_use]
    pub fn current_tick(&self) -> Tick {
        self.now_tick
    }

    /// Swap the definition set. Running sessions keep the snapshot they
    /// started with; new starts and reconnects use the new set.
    pub fn reload_definitions(&mut self, defs: Vec<QuestDefinition>) -> LoadReport {
        let report = self.registry.reload(defs);
        info!(
            loaded = report.loaded,
            rejected = report.rejected.len(),
            warnings = report.warnings.len(),
            "Quest definitions reloaded"
        );
        report
    }

    /// Current definition snapshot.
    #[must_use]
    pub fn definitions(&self) -> Arc<DefinitionSet> {
        self.registry.snapshot()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a quest for a player. The first node runs on the next tick.
    ///
    /// When the player already has persisted progress for the quest but no
    /// live session (e.g. the caller skipped [`Self::on_connect`]), the
    /// session is resumed from that progress instead.
    ///
    /// # Errors
    /// A precondition failure, or a store error while loading the player.
    pub fn start_quest(&mut self, player: PlayerId, quest: &QuestId, host: &mut dyn Host) -> Result<()> {
        let def = self
            .registry
            .get(quest)
            .ok_or_else(|| QuestError::UnknownQuest(quest.clone()))?;
        let now = self.now();
        let key = (player, quest.clone());

        if self.sessions.contains_key(&key) {
            return Err(QuestError::AlreadyActive(quest.clone()));
        }
        if self.cache.get(player, now)?.is_active(quest) {
            self.resume_session(player, def);
            return Ok(());
        }

        requirements::check_start(
            &def,
            self.cache.get(player, now)?,
            &*host,
            player,
            now,
            self.config.general.max_active,
        )?;

        let start = def
            .start_ref(&self.config.interpreter.start_branch)
            .ok_or_else(|| QuestError::InvalidDefinition {
                quest: quest.clone(),
                reason: "no start node".to_string(),
            })?;
        let ephemeral = !def.save_progress;
        self.cache.modify(player, now, |state| {
            let mut progress = QuestProgress::new(&start, now);
            progress.ephemeral = ephemeral;
            if let Some(history) = state.histories.get(quest) {
                progress.history = history.clone();
            }
            state.active.insert(quest.clone(), progress);
        })?;

        self.sessions.insert(key, Session::new(player, def));
        self.schedule(player, quest, &start.branch, 0, TaskAction::Run);
        QuestCounters::bump(&self.counters.sessions_started);
        info!(%player, %quest, start = %start, "Quest started");
        Ok(())
    }

    /// Stop a quest: cancel its tasks, effects, navigation and menus,
    /// drop its progress and run its stop hook once.
    ///
    /// # Errors
    /// [`QuestError::NotActive`] when the quest is not running.
    pub fn stop_quest(&mut self, player: PlayerId, quest: &QuestId, host: &mut dyn Host) -> Result<()> {
        let active = self.cache.peek(player).is_some_and(|s| s.is_active(quest));
        match self.take_session(player, quest) {
            Some(mut session) => {
                self.stop_session(&mut session, host);
                Ok(())
            }
            None if active => {
                // Persisted but not live (player offline or never connected).
                let now = self.now();
                let definition = self.registry.get(quest);
                self.scheduler.cancel_quest(player, quest);
                self.cache.modify(player, now, |state| state.active.remove(quest))?;
                if let Some(def) = definition {
                    self.run_detached(player, quest, &def.on_stop, host);
                }
                QuestCounters::bump(&self.counters.quests_ended);
                info!(%player, %quest, "Quest stopped (no live session)");
                Ok(())
            }
            None => Err(QuestError::NotActive(quest.clone())),
        }
    }

    /// Player came online: mark the entry non-evictable, create sessions
    /// for persisted quests and schedule each cursor. Returns the number of
    /// quests resumed.
    ///
    /// # Errors
    /// When the player cannot be loaded.
    pub fn on_connect(&mut self, player: PlayerId, _host: &mut dyn Host) -> Result<usize> {
        let now = self.now();
        self.cache.set_online(player, true, now)?;
        let quests: Vec<QuestId> = self.cache.get(player, now)?.active.keys().cloned().collect();

        let mut resumed = 0;
        for quest in quests {
            if self.sessions.contains_key(&(player, quest.clone())) {
                continue;
            }
            let Some(def) = self.registry.get(&quest) else {
                warn!(%player, %quest, "Persisted quest has no definition; left untouched");
                continue;
            };
            self.count_connect(player, &def);
            self.resume_session(player, def);
            resumed += 1;
        }
        info!(%player, resumed, "Player connected");
        Ok(resumed)
    }

    /// Player went offline: drop live sessions and continuations, cancel
    /// effects and navigation, discard ephemeral quests. Persisted progress
    /// is kept and resumed by the next [`Self::on_connect`].
    pub fn on_disconnect(&mut self, player: PlayerId, host: &mut dyn Host) {
        let quests: Vec<QuestId> = self
            .sessions
            .keys()
            .filter(|(p, _)| *p == player)
            .map(|(_, q)| q.clone())
            .collect();
        self.record_waits(player, &quests);
        for quest in &quests {
            if let Some(mut session) = self.take_session(player, quest) {
                self.teardown(&mut session, host);
            }
        }
        self.scheduler.cancel_player(player);
        self.tokens.retain(|_, (p, _)| *p != player);
        if let Some(fx) = self.caps.effects.as_mut() {
            fx.cancel_player(player);
        }

        let now = self.now();
        let has_ephemeral = self
            .cache
            .peek(player)
            .is_some_and(|s| s.active.values().any(|p| p.ephemeral));
        if has_ephemeral {
            if let Err(e) = self.cache.modify(player, now, |state| {
                state.active.retain(|_, p| !p.ephemeral);
            }) {
                warn!(%player, error = %e, "Could not drop ephemeral progress");
            }
        }
        if let Err(e) = self.cache.set_online(player, false, now) {
            warn!(%player, error = %e, "Could not mark player offline");
        }
        info!(%player, sessions = quests.len(), "Player disconnected");
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Advance one tick: run due tasks, then effects. Returns the number of
    /// tasks executed.
    pub fn tick(&mut self, host: &mut dyn Host) -> usize {
        self.now_tick += 1;
        let _span = tracing::debug_span!(crate::metrics::spans::TICK, tick = self.now_tick).entered();

        let due = self.scheduler.take_due(self.now_tick);
        let executed = due.len();
        for task in due {
            let Some(mut session) = self.take_session(task.player, &task.quest) else {
                continue;
            };
            match task.action {
                TaskAction::Run => self.run_branch(&mut session, task.branch, Entry::Execute, host),
                TaskAction::Resume { node, index } => {
                    let at_node = self.with_cursor(&session, &task.branch, |c| {
                        if c.node == node {
                            c.resume_at = Some(index);
                            true
                        } else {
                            false
                        }
                    });
                    if at_node == Some(true) {
                        self.run_branch(&mut session, task.branch, Entry::Execute, host);
                    }
                }
                TaskAction::Timer { node, ticks } => {
                    self.timer_elapsed(&mut session, &task.branch, &node, ticks, host);
                }
            }
            self.put_session(session);
        }

        if let Some(fx) = self.caps.effects.as_mut() {
            let _fx = tracing::debug_span!(crate::metrics::spans::EFFECTS).entered();
            fx.tick(host);
        }
        executed
    }

    /// Externally complete an objective node. A node currently under a
    /// cursor finishes immediately; a not-yet-run child of a running group
    /// counts toward that group.
    ///
    /// # Errors
    /// [`QuestError::NoSession`] or [`QuestError::UnknownNode`].
    pub fn complete_objective(
        &mut self,
        player: PlayerId,
        quest: &QuestId,
        node: &str,
        host: &mut dyn Host,
    ) -> Result<()> {
        let mut session = self.require_session(player, quest)?;
        let result = self.complete_in_session(&mut session, node, host);
        self.put_session(session);
        result
    }

    /// Jump a quest's cursor to a target (`node`, `branch:node`, `@branch`
    /// or an outcome), cancelling whatever that branch was waiting on.
    ///
    /// # Errors
    /// [`QuestError::NoSession`], [`QuestError::UnknownNode`] or
    /// [`QuestError::UnknownBranch`].
    pub fn goto_node(&mut self, player: PlayerId, quest: &QuestId, target: &str, host: &mut dyn Host) -> Result<()> {
        let mut session = self.require_session(player, quest)?;
        let result = self.jump(&mut session, target, host);
        self.put_session(session);
        result
    }

    /// A menu entry was selected. `index` is the choice index carried by
    /// the rendered [`crate::host::MenuEntry`].
    ///
    /// # Errors
    /// [`QuestError::UnknownToken`] or [`QuestError::InvalidChoice`].
    pub fn handle_choice(&mut self, player: PlayerId, token: u64, index: usize, host: &mut dyn Host) -> Result<()> {
        let mut session = self.session_for_token(player, token)?;
        let result = self.choose(&mut session, token, index, host);
        self.put_session(session);
        result
    }

    /// Scroll an open menu by `delta` pages and re-render it.
    ///
    /// # Errors
    /// [`QuestError::UnknownToken`].
    pub fn handle_menu_scroll(&mut self, player: PlayerId, token: u64, delta: i64, host: &mut dyn Host) -> Result<()> {
        let mut session = self.session_for_token(player, token)?;
        let result = self.scroll(&mut session, token, delta, host);
        self.put_session(session);
        result
    }

    /// The player confirmed a click prompt.
    ///
    /// # Errors
    /// [`QuestError::UnknownToken`].
    pub fn handle_prompt_click(&mut self, player: PlayerId, token: u64, host: &mut dyn Host) -> Result<()> {
        let mut session = self.session_for_token(player, token)?;
        let result = self.resume_token(&mut session, token, false, host);
        self.put_session(session);
        result
    }

    /// External navigation reached its destination.
    ///
    /// # Errors
    /// [`QuestError::UnknownToken`].
    pub fn handle_navigation_complete(&mut self, player: PlayerId, token: u64, host: &mut dyn Host) -> Result<()> {
        let mut session = self.session_for_token(player, token)?;
        let result = self.resume_token(&mut session, token, true, host);
        self.put_session(session);
        result
    }

    /// Interaction with a target. Returns the number of nodes that advanced.
    pub fn handle_interact(&mut self, player: PlayerId, target: &str, kind: InteractKind, host: &mut dyn Host) -> usize {
        self.handle_event(
            player,
            &WorldEvent::Interact {
                target: target.to_string(),
                kind,
            },
            host,
        )
    }

    /// Feed a world event to every live session of the player. Returns the
    /// number of nodes that advanced.
    pub fn handle_event(&mut self, player: PlayerId, event: &WorldEvent, host: &mut dyn Host) -> usize {
        let mut quests: Vec<QuestId> = self
            .sessions
            .keys()
            .filter(|(p, _)| *p == player)
            .map(|(_, q)| q.clone())
            .collect();
        quests.sort();

        let mut advanced = 0;
        for quest in quests {
            let Some(mut session) = self.take_session(player, &quest) else {
                continue;
            };
            advanced += self.dispatch_event(&mut session, event, host);
            self.put_session(session);
        }
        if advanced > 0 {
            debug!(%player, event = event.name(), advanced, "Event advanced objectives");
        }
        advanced
    }

    /// Whether a command may run; quests can block command prefixes.
    ///
    /// # Errors
    /// [`QuestError::CommandRestricted`] naming the first blocking quest.
    pub fn check_command(&self, player: PlayerId, command: &str) -> Result<()> {
        let Some(state) = self.cache.peek(player) else {
            return Ok(());
        };
        for quest in state.active.keys() {
            let def = self
                .sessions
                .get(&(player, quest.clone()))
                .map(|s| Arc::clone(&s.definition))
                .or_else(|| self.registry.get(quest));
            if def.is_some_and(|d| primitives::command_blocked(command, &d.blocked_commands)) {
                return Err(QuestError::CommandRestricted {
                    quest: quest.clone(),
                    command: command.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Set or delete (`None`) a variable. Quest scope requires `quest`.
    ///
    /// # Errors
    /// [`QuestError::NotActive`] for quest scope without an active quest,
    /// or a store error while loading the player.
    pub fn set_variable(
        &mut self,
        player: PlayerId,
        quest: Option<&QuestId>,
        scope: VarScope,
        name: &str,
        value: Option<String>,
    ) -> Result<()> {
        if scope == VarScope::Quest {
            let quest = quest.ok_or_else(|| QuestError::NotActive(QuestId::from("")))?;
            let now = self.now();
            if !self.cache.get(player, now)?.is_active(quest) {
                return Err(QuestError::NotActive(quest.clone()));
            }
        }
        self.write_variable(player, quest, scope, name, value)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Quests active for a cached player.
    #[must_use]
    pub fn active_quests(&self, player: PlayerId) -> Vec<QuestId> {
        self.cache
            .peek(player)
            .map(|s| s.active.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Progress of one quest for a cached player.
    #[must_use]
    pub fn progress(&self, player: PlayerId, quest: &QuestId) -> Option<&QuestProgress> {
        self.cache.peek(player)?.active.get(quest)
    }

    /// Cached state of a player, if loaded.
    #[must_use]
    pub fn player(&self, player: PlayerId) -> Option<&PlayerState> {
        self.cache.peek(player)
    }

    /// Whether a live session exists.
    #[must_use]
    pub fn has_session(&self, player: PlayerId, quest: &QuestId) -> bool {
        self.sessions.contains_key(&(player, quest.clone()))
    }

    /// Live session count.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Scheduled task count across all players.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Scheduled task count of one player.
    #[must_use]
    pub fn scheduled_for(&self, player: PlayerId) -> usize {
        self.scheduler.pending_for(player)
    }

    /// Live continuation tokens of one player.
    #[must_use]
    pub fn tokens_for(&self, player: PlayerId) -> usize {
        self.tokens.values().filter(|(p, _)| *p == player).count()
    }

    /// Detail of the first objective the quest waits on, for scoreboards
    /// and quest logs.
    #[must_use]
    pub fn current_objective_detail(&self, player: PlayerId, quest: &QuestId, host: &dyn Host) -> Option<ObjectiveDetail> {
        let state = self.cache.peek(player)?;
        let progress = state.active.get(quest)?;
        let def = self
            .sessions
            .get(&(player, quest.clone()))
            .map(|s| Arc::clone(&s.definition))
            .or_else(|| self.registry.get(quest))?;
        let scope = Scope {
            player,
            quest: Some(quest),
            state: Some(state),
            server: self.cache.server(),
            host,
        };

        progress.positions().into_iter().find_map(|at| {
            let node = def.node(&at)?;
            if node.objective.is_none() && !node.kind.is_objective() {
                return None;
            }
            let (current, required) = objectives::measure(&node.kind, &at, progress);
            Some(ObjectiveDetail {
                text: node.objective.as_deref().map(|t| scope.interpolate(t)).unwrap_or_default(),
                at,
                current,
                required,
            })
        })
    }

    // -----------------------------------------------------------------------
    // Persistence plumbing
    // -----------------------------------------------------------------------

    /// Snapshot dirty entries for the write-behind worker.
    pub fn collect_dirty(&mut self) -> Vec<WriteRequest> {
        let requests = self.cache.collect_dirty();
        for _ in &requests {
            QuestCounters::bump(&self.counters.saves_enqueued);
        }
        requests
    }

    /// Apply a worker completion.
    pub fn apply_completion(&mut self, completion: &WriteCompletion) -> CompletionOutcome {
        let outcome = self.cache.complete(completion);
        match outcome {
            CompletionOutcome::Clean => QuestCounters::bump(&self.counters.saves_completed),
            CompletionOutcome::Stale => QuestCounters::bump(&self.counters.stale_completions),
            CompletionOutcome::Failed => QuestCounters::bump(&self.counters.save_failures),
            CompletionOutcome::Ignored => {}
        }
        outcome
    }

    /// Whether a player has edits not yet confirmed by the store.
    #[must_use]
    pub fn is_dirty(&self, player: PlayerId) -> bool {
        self.cache.is_dirty(player)
    }

    /// Return a request that could not be submitted to the dirty set.
    pub fn abandon_write(&mut self, request: &WriteRequest) {
        self.cache.abandon(request);
    }

    /// Evict idle offline entries. Returns how many were evicted.
    pub fn evict_idle(&mut self) -> usize {
        let now = self.now();
        let evicted = self.cache.evict_idle(now);
        for _ in 0..evicted {
            QuestCounters::bump(&self.counters.cache_evictions);
        }
        evicted
    }

    /// Write every dirty entry synchronously (shutdown path).
    ///
    /// # Errors
    /// The first store error.
    pub fn flush_sync(&mut self) -> Result<usize> {
        self.cache.flush_sync()
    }

    /// Whether a checkpoint node asked for an immediate flush since the
    /// last call. Clears the request.
    pub fn take_flush_request(&mut self) -> bool {
        std::mem::take(&mut self.flush_requested)
    }

    // -----------------------------------------------------------------------
    // Internals shared by the submodules
    // -----------------------------------------------------------------------

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn take_session(&mut self, player: PlayerId, quest: &QuestId) -> Option<Session> {
        self.sessions.remove(&(player, quest.clone()))
    }

    fn put_session(&mut self, session: Session) {
        if !session.ended {
            self.sessions.insert((session.player, session.quest.clone()), session);
        }
    }

    fn require_session(&mut self, player: PlayerId, quest: &QuestId) -> Result<Session> {
        self.take_session(player, quest).ok_or_else(|| QuestError::NoSession {
            player,
            quest: quest.clone(),
        })
    }

    fn session_for_token(&mut self, player: PlayerId, token: u64) -> Result<Session> {
        let quest = match self.tokens.get(&token) {
            Some((owner, quest)) if *owner == player => quest.clone(),
            _ => return Err(QuestError::UnknownToken(token)),
        };
        self.take_session(player, &quest).ok_or(QuestError::UnknownToken(token))
    }

    fn issue_token(&mut self, player: PlayerId, quest: &QuestId) -> u64 {
        self.next_token += 1;
        self.tokens.insert(self.next_token, (player, quest.clone()));
        self.next_token
    }

    fn release_tokens(&mut self, tokens: &[u64]) {
        for token in tokens {
            self.tokens.remove(token);
        }
    }

    fn schedule(&mut self, player: PlayerId, quest: &QuestId, branch: &str, delay: Tick, action: TaskAction) {
        self.scheduler.schedule(
            self.now_tick + delay,
            Task {
                player,
                quest: quest.clone(),
                branch: branch.to_string(),
                action,
            },
        );
    }

    /// Read-only scope for interpolation and conditions.
    fn scope<'a>(&'a self, player: PlayerId, quest: Option<&'a QuestId>, host: &'a dyn Host) -> Scope<'a> {
        Scope {
            player,
            quest,
            state: self.cache.peek(player),
            server: self.cache.server(),
            host,
        }
    }

    fn interpolate(&self, player: PlayerId, quest: &QuestId, host: &dyn Host, text: &str) -> String {
        self.scope(player, Some(quest), host).interpolate(text)
    }

    /// Mutate the progress of the session's quest (marks the player dirty).
    fn with_progress<R>(&mut self, session: &Session, f: impl FnOnce(&mut QuestProgress) -> R) -> Option<R> {
        let now = self.now();
        let state = self.cache.state_mut(session.player, now).ok()?;
        state.active.get_mut(&session.quest).map(f)
    }

    fn with_cursor<R>(
        &mut self,
        session: &Session,
        branch: &str,
        f: impl FnOnce(&mut crate::state::Cursor) -> R,
    ) -> Option<R> {
        self.with_progress(session, |p| p.cursors.get_mut(branch).map(f)).flatten()
    }

    fn cursor(&self, session: &Session, branch: &str) -> Option<crate::state::Cursor> {
        self.cache
            .peek(session.player)?
            .active
            .get(&session.quest)?
            .cursors
            .get(branch)
            .cloned()
    }

    /// Store what is left of every pending delay of a player's sessions, so
    /// a resumed session waits out the remainder instead of the full delay.
    fn record_waits(&mut self, player: PlayerId, quests: &[QuestId]) {
        let mut left = Vec::new();
        if let Some(state) = self.cache.peek(player) {
            for quest in quests {
                let Some(progress) = state.active.get(quest) else {
                    continue;
                };
                for (branch, cursor) in &progress.cursors {
                    if cursor.wait.is_none() {
                        continue;
                    }
                    if let Some(ticks) = self.scheduler.next_run_in(player, quest, branch, self.now_tick) {
                        left.push((quest.clone(), branch.clone(), ticks));
                    }
                }
            }
        }
        if left.is_empty() {
            return;
        }
        let now = self.now();
        let result = self.cache.modify(player, now, |state| {
            for (quest, branch, ticks) in &left {
                if let Some(cursor) = state.active.get_mut(quest).and_then(|p| p.cursors.get_mut(branch)) {
                    cursor.wait = Some(*ticks);
                }
            }
        });
        if let Err(e) = result {
            warn!(%player, error = %e, "Could not record pending waits");
        }
    }

    /// Recreate a live session for persisted progress and schedule every cursor.
    fn resume_session(&mut self, player: PlayerId, def: Arc<QuestDefinition>) {
        let quest = def.id.clone();
        let branches: Vec<(String, Tick)> = self
            .cache
            .peek(player)
            .and_then(|s| s.active.get(&quest))
            .map(|p| {
                p.cursors
                    .iter()
                    .map(|(b, c)| (b.clone(), c.wait.unwrap_or(0)))
                    .collect()
            })
            .unwrap_or_default();
        for (branch, delay) in &branches {
            self.schedule(player, &quest, branch, *delay, TaskAction::Run);
        }
        debug!(%player, %quest, branches = branches.len(), "Session resumed");
        self.sessions.insert((player, quest), Session::new(player, def));
    }

    /// Count a login toward every connect objective the quest waits on.
    fn count_connect(&mut self, player: PlayerId, def: &QuestDefinition) {
        let now = self.now();
        let Some(positions) = self
            .cache
            .peek(player)
            .and_then(|s| s.active.get(&def.id))
            .map(QuestProgress::positions)
        else {
            return;
        };
        let keys: Vec<String> = positions
            .iter()
            .filter(|at| matches!(def.node(at).map(|n| &n.kind), Some(NodeKind::Connect { .. })))
            .map(NodeRef::counter_key)
            .collect();
        if keys.is_empty() {
            return;
        }
        let result = self.cache.modify(player, now, |state| {
            if let Some(progress) = state.active.get_mut(&def.id) {
                for key in &keys {
                    progress.add_counter(key, 1.0);
                }
            }
        });
        if let Err(e) = result {
            warn!(%player, error = %e, "Could not count connect objective");
        }
    }

    /// Write a variable in any scope.
    fn write_variable(
        &mut self,
        player: PlayerId,
        quest: Option<&QuestId>,
        scope: VarScope,
        name: &str,
        value: Option<String>,
    ) -> Result<()> {
        let now = self.now();
        match scope {
            VarScope::Quest => {
                let Some(quest) = quest else {
                    return Ok(());
                };
                self.cache.modify(player, now, |state| {
                    if let Some(progress) = state.active.get_mut(quest) {
                        match value {
                            Some(v) => progress.variables.insert(name.to_string(), v),
                            None => progress.variables.remove(name),
                        };
                    }
                })
            }
            VarScope::User => self.cache.modify(player, now, |state| {
                match value {
                    Some(v) => state.user_vars.insert(name.to_string(), v),
                    None => state.user_vars.remove(name),
                };
            }),
            VarScope::Server => {
                self.cache.set_server_var(name, value);
                Ok(())
            }
        }
    }

    /// Parse a goto target relative to `branch`.
    fn target(&self, raw: &str, branch: &str) -> Target {
        Target::parse(raw, branch, &self.config.interpreter.outcome_prefix)
    }
}
