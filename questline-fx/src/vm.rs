//! The tick-budgeted effect VM.
//!
//! Every run keeps its own program counter, loop frame stack and variable
//! map. A tick walks the runs round-robin, giving each at most
//! `per_run_budget` instructions and all of them together at most
//! `global_budget`, so a long loop cannot starve the tick. `wait` parks a
//! run for a number of ticks without spending budget while parked.
//!
//! Runs end when their program ends (unless repeating), when their anchor
//! can no longer be resolved, or when they are cancelled.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use questline_core::config::EffectsConfig;
use questline_core::definition::EffectMode;
use questline_core::expr::{Expr, VarRef};
use questline_core::host::{EffectRequest, EffectRunner, Host};
use questline_core::types::{Location, PlayerId, QuestId};

use crate::error::{FxError, Result};
use crate::program::{EffectSource, Instr, Program};

const EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Frame {
    head: usize,
    var: String,
    end: f64,
    step: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Finished,
}

#[derive(Debug)]
struct Run {
    id: u64,
    player: PlayerId,
    quest: QuestId,
    effect: String,
    program: Arc<Program>,
    mode: EffectMode,
    anchor: Option<Location>,
    pc: usize,
    frames: Vec<Frame>,
    vars: HashMap<String, f64>,
    waiting: u64,
}

impl Run {
    fn seed(&mut self, at: &Location) {
        self.vars.insert("baseX".to_string(), at.x);
        self.vars.insert("baseY".to_string(), at.y);
        self.vars.insert("baseZ".to_string(), at.z);
    }

    /// Execute up to `budget` instructions. Returns the instructions spent.
    fn execute(&mut self, budget: u32, at: &Location, host: &mut dyn Host) -> (u32, Status) {
        let program = Arc::clone(&self.program);
        let mut used = 0;
        while used < budget {
            let Some(instr) = program.instrs().get(self.pc) else {
                return match self.mode {
                    EffectMode::Once => (used, Status::Finished),
                    EffectMode::Repeat => {
                        self.pc = 0;
                        self.frames.clear();
                        (used, Status::Running)
                    }
                };
            };
            used += 1;
            match instr {
                Instr::Set { var, value } => {
                    let v = eval(&self.vars, value);
                    self.vars.insert(var.clone(), v);
                    self.pc += 1;
                }
                Instr::Wait { ticks } => {
                    self.pc += 1;
                    let ticks = to_count(eval(&self.vars, ticks));
                    if ticks > 0 {
                        self.waiting = u64::from(ticks);
                        return (used, Status::Running);
                    }
                }
                Instr::Display {
                    particle,
                    x,
                    y,
                    z,
                    count,
                } => {
                    let point = Location::new(
                        at.world.clone(),
                        eval(&self.vars, x),
                        eval(&self.vars, y),
                        eval(&self.vars, z),
                    );
                    let count = to_count(eval(&self.vars, count));
                    host.display_particle(self.player, particle, &point, count);
                    self.pc += 1;
                }
                Instr::LoopHead {
                    var,
                    start,
                    end,
                    step,
                    exit,
                } => {
                    let (first, last, step) = (eval(&self.vars, start), eval(&self.vars, end), eval(&self.vars, step));
                    if in_range(first, last, step) {
                        self.vars.insert(var.clone(), first);
                        self.frames.push(Frame {
                            head: self.pc,
                            var: var.clone(),
                            end: last,
                            step,
                        });
                        self.pc += 1;
                    } else {
                        self.pc = *exit;
                    }
                }
                Instr::LoopTail { head } => {
                    let advance = match self.frames.last() {
                        Some(frame) if frame.head == *head => {
                            let next = self.vars.get(&frame.var).copied().unwrap_or(0.0) + frame.step;
                            Some((frame.var.clone(), next, in_range(next, frame.end, frame.step)))
                        }
                        _ => None,
                    };
                    match advance {
                        Some((var, next, true)) => {
                            self.vars.insert(var, next);
                            self.pc = head + 1;
                        }
                        Some((_, _, false)) => {
                            self.frames.pop();
                            self.pc += 1;
                        }
                        None => self.pc += 1,
                    }
                }
            }
        }
        (used, Status::Running)
    }
}

fn eval(vars: &HashMap<String, f64>, expr: &Expr) -> f64 {
    let resolve = |v: &VarRef| match v.scope {
        None => vars.get(&v.name).copied(),
        Some(_) => None,
    };
    expr.eval_or_zero(&resolve)
}

fn in_range(value: f64, end: f64, step: f64) -> bool {
    if !step.is_finite() || step == 0.0 {
        return false;
    }
    if step > 0.0 {
        value <= end + EPSILON
    } else {
        value >= end - EPSILON
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_count(value: f64) -> u32 {
    if value.is_finite() {
        value.round().clamp(0.0, f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Library {
    #[serde(default)]
    effects: HashMap<String, EffectSource>,
}

/// Effect library plus the runs it is currently rendering.
#[derive(Debug)]
pub struct EffectVm {
    config: EffectsConfig,
    sources: HashMap<String, EffectSource>,
    programs: LruCache<String, Arc<Program>>,
    runs: Vec<Run>,
    next_run: u64,
    rotation: usize,
    executed_last_tick: u32,
}

impl EffectVm {
    /// Create an empty VM.
    #[must_use]
    pub fn new(config: EffectsConfig) -> Self {
        let capacity = NonZeroUsize::new(config.script_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            sources: HashMap::new(),
            programs: LruCache::new(capacity),
            runs: Vec::new(),
            next_run: 1,
            rotation: 0,
            executed_last_tick: 0,
        }
    }

    /// Register (or replace) an effect. Compilation happens on first use.
    pub fn register(&mut self, id: impl Into<String>, source: EffectSource) {
        let id = id.into();
        self.programs.pop(&id);
        self.sources.insert(id, source);
    }

    /// Register every effect of a TOML library:
    ///
    /// ```toml
    /// [effects]
    /// ring = { flat = { particle = "FLAME", points = 8, radius = 1.5 } }
    /// spiral = { script = "loop(i, 0, 20) display(END_ROD, baseX, baseY + i / 10, baseZ) end" }
    /// ```
    ///
    /// # Errors
    /// Returns [`FxError::Library`] when the TOML does not parse.
    pub fn load_library(&mut self, toml_str: &str) -> Result<usize> {
        let library: Library = toml::from_str(toml_str).map_err(|e| FxError::Library(e.to_string()))?;
        let count = library.effects.len();
        for (id, source) in library.effects {
            self.register(id, source);
        }
        debug!(count, "Effect library loaded");
        Ok(count)
    }

    /// Fetch a compiled program, compiling and caching it when needed.
    ///
    /// # Errors
    /// [`FxError::UnknownEffect`] or a compile error.
    pub fn program(&mut self, id: &str) -> Result<Arc<Program>> {
        if let Some(program) = self.programs.get(id) {
            return Ok(Arc::clone(program));
        }
        let source = self
            .sources
            .get(id)
            .ok_or_else(|| FxError::UnknownEffect(id.to_string()))?;
        let program = Arc::new(Program::compile(source)?);
        trace!(effect = id, instrs = program.len(), "Effect compiled");
        self.programs.put(id.to_string(), Arc::clone(&program));
        Ok(program)
    }

    /// Compiled programs currently cached.
    #[must_use]
    pub fn cached_programs(&self) -> usize {
        self.programs.len()
    }

    /// Runs belonging to one player.
    #[must_use]
    pub fn runs_for(&self, player: PlayerId) -> usize {
        self.runs.iter().filter(|r| r.player == player).count()
    }

    /// Instructions executed during the last tick, across all runs.
    #[must_use]
    pub fn executed_last_tick(&self) -> u32 {
        self.executed_last_tick
    }
}

impl EffectRunner for EffectVm {
    fn start(&mut self, request: EffectRequest) -> bool {
        let limit = self.config.max_runs_per_player;
        if limit > 0 && self.runs_for(request.player) >= limit {
            debug!(player = %request.player, effect = %request.effect, limit, "Effect run limit reached");
            return false;
        }
        let program = match self.program(&request.effect) {
            Ok(program) => program,
            Err(e) => {
                warn!(player = %request.player, effect = %request.effect, error = %e, "Effect refused");
                return false;
            }
        };
        let id = self.next_run;
        self.next_run += 1;
        self.runs.push(Run {
            id,
            player: request.player,
            quest: request.quest,
            effect: request.effect,
            program,
            mode: request.mode,
            anchor: request.anchor,
            pc: 0,
            frames: Vec::new(),
            vars: HashMap::new(),
            waiting: 0,
        });
        true
    }

    fn cancel_player(&mut self, player: PlayerId) {
        self.runs.retain(|r| r.player != player);
    }

    fn cancel_quest(&mut self, player: PlayerId, quest: &QuestId) {
        self.runs.retain(|r| r.player != player || r.quest != *quest);
    }

    fn tick(&mut self, host: &mut dyn Host) {
        let count = self.runs.len();
        self.executed_last_tick = 0;
        if count == 0 {
            return;
        }
        let per_run = self.config.per_run_budget.max(1);
        let mut remaining = self.config.global_budget;
        let first = self.rotation % count;
        let mut finished: Vec<u64> = Vec::new();

        for offset in 0..count {
            let run = &mut self.runs[(first + offset) % count];
            let Some(at) = run.anchor.clone().or_else(|| host.location_of(run.player)) else {
                debug!(player = %run.player, effect = %run.effect, "Effect anchor lost; run cancelled");
                finished.push(run.id);
                continue;
            };
            if run.waiting > 0 {
                run.waiting -= 1;
                if run.waiting > 0 {
                    continue;
                }
            }
            if remaining == 0 {
                continue;
            }
            run.seed(&at);
            let (used, status) = run.execute(per_run.min(remaining), &at, host);
            remaining -= used;
            if status == Status::Finished {
                finished.push(run.id);
            }
        }

        self.rotation = self.rotation.wrapping_add(1);
        self.executed_last_tick = self.config.global_budget - remaining;
        if !finished.is_empty() {
            self.runs.retain(|r| !finished.contains(&r.id));
        }
    }

    fn active_runs(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::FlatEffect;

    #[derive(Default)]
    struct Canvas {
        location: Option<Location>,
        points: Vec<(String, Location, u32)>,
    }

    impl Host for Canvas {
        fn location_of(&self, _player: PlayerId) -> Option<Location> {
            self.location.clone()
        }
        fn display_particle(&mut self, _player: PlayerId, particle: &str, at: &Location, count: u32) {
            self.points.push((particle.to_string(), at.clone(), count));
        }
    }

    fn canvas() -> Canvas {
        Canvas {
            location: Some(Location::new("world", 10.0, 64.0, -5.0)),
            points: Vec::new(),
        }
    }

    fn request(player: PlayerId, effect: &str, mode: EffectMode) -> EffectRequest {
        EffectRequest {
            player,
            quest: QuestId::from("q"),
            effect: effect.to_string(),
            mode,
            anchor: None,
        }
    }

    fn vm_with(script: &str, config: EffectsConfig) -> EffectVm {
        let mut vm = EffectVm::new(config);
        vm.register("fx", EffectSource::Script(script.to_string()));
        vm
    }

    #[test]
    fn inclusive_loop_emits_four_displays_once() {
        let mut vm = vm_with(
            "loop(i,0,3,1) display(FLAME, baseX+i, baseY, baseZ, 5)",
            EffectsConfig::default(),
        );
        let mut host = canvas();
        let player = PlayerId::new();
        assert!(vm.start(request(player, "fx", EffectMode::Once)));

        vm.tick(&mut host);
        vm.tick(&mut host);

        let xs: Vec<f64> = host.points.iter().map(|(_, at, _)| at.x).collect();
        assert_eq!(xs, vec![10.0, 11.0, 12.0, 13.0]);
        assert!(host.points.iter().all(|(p, at, n)| p == "FLAME" && at.y == 64.0 && *n == 5));
        assert_eq!(vm.active_runs(), 0);
    }

    #[test]
    fn wait_parks_without_spending_budget() {
        let mut vm = vm_with(
            "display(A, 0, 0, 0)\nwait(2)\ndisplay(B, 0, 0, 0)",
            EffectsConfig::default(),
        );
        let mut host = canvas();
        assert!(vm.start(request(PlayerId::new(), "fx", EffectMode::Once)));

        vm.tick(&mut host);
        assert_eq!(host.points.len(), 1);
        assert_eq!(vm.executed_last_tick(), 2);

        vm.tick(&mut host);
        assert_eq!(host.points.len(), 1);
        assert_eq!(vm.executed_last_tick(), 0);

        vm.tick(&mut host);
        assert_eq!(host.points.len(), 2);
        assert_eq!(host.points[1].0, "B");
    }

    #[test]
    fn budgets_bound_each_tick() {
        let config = EffectsConfig {
            global_budget: 15,
            per_run_budget: 10,
            ..EffectsConfig::default()
        };
        let mut vm = vm_with("loop(i, 1, 1000) display(DUST, i, 0, 0) end", config);
        let mut host = canvas();
        assert!(vm.start(request(PlayerId::new(), "fx", EffectMode::Once)));
        assert!(vm.start(request(PlayerId::new(), "fx", EffectMode::Once)));

        vm.tick(&mut host);
        assert_eq!(vm.executed_last_tick(), 15);
        vm.tick(&mut host);
        assert_eq!(vm.executed_last_tick(), 15);
        assert_eq!(vm.active_runs(), 2);
    }

    #[test]
    fn lost_anchor_cancels_the_run() {
        let mut vm = vm_with("wait(5) display(A, 0, 0, 0)", EffectsConfig::default());
        let mut host = Canvas::default();
        assert!(vm.start(request(PlayerId::new(), "fx", EffectMode::Once)));
        vm.tick(&mut host);
        assert_eq!(vm.active_runs(), 0);
        assert!(host.points.is_empty());
    }

    #[test]
    fn fixed_anchor_needs_no_player_location() {
        let mut vm = vm_with("display(A, baseX, baseY, baseZ)", EffectsConfig::default());
        let mut host = Canvas::default();
        let mut req = request(PlayerId::new(), "fx", EffectMode::Once);
        req.anchor = Some(Location::new("nether", 1.0, 2.0, 3.0));
        assert!(vm.start(req));
        vm.tick(&mut host);
        assert_eq!(host.points.len(), 1);
        assert_eq!(host.points[0].1, Location::new("nether", 1.0, 2.0, 3.0));
    }

    #[test]
    fn repeat_restarts_until_cancelled() {
        let mut vm = vm_with("display(A, 0, 0, 0) wait(1)", EffectsConfig::default());
        let mut host = canvas();
        let player = PlayerId::new();
        assert!(vm.start(request(player, "fx", EffectMode::Repeat)));
        for _ in 0..6 {
            vm.tick(&mut host);
        }
        assert!(host.points.len() >= 3);
        assert_eq!(vm.active_runs(), 1);

        vm.cancel_quest(player, &QuestId::from("other"));
        assert_eq!(vm.active_runs(), 1);
        vm.cancel_quest(player, &QuestId::from("q"));
        assert_eq!(vm.active_runs(), 0);
    }

    #[test]
    fn per_player_limit_and_unknown_effects_refuse() {
        let config = EffectsConfig {
            max_runs_per_player: 1,
            ..EffectsConfig::default()
        };
        let mut vm = vm_with("wait(100)", config);
        let player = PlayerId::new();
        assert!(vm.start(request(player, "fx", EffectMode::Once)));
        assert!(!vm.start(request(player, "fx", EffectMode::Once)));
        assert!(vm.start(request(PlayerId::new(), "fx", EffectMode::Once)));
        assert!(!vm.start(request(PlayerId::new(), "missing", EffectMode::Once)));

        vm.cancel_player(player);
        assert_eq!(vm.runs_for(player), 0);
    }

    #[test]
    fn cache_evicts_and_recompiles() {
        let config = EffectsConfig {
            script_cache_size: 1,
            ..EffectsConfig::default()
        };
        let mut vm = EffectVm::new(config);
        vm.register("a", EffectSource::Script("display(A, 0, 0, 0)".into()));
        vm.register(
            "b",
            EffectSource::Flat(FlatEffect {
                particle: "B".into(),
                points: 4,
                radius: 1.0,
                height: 0.0,
                count: 1,
                interval: 0,
            }),
        );
        assert!(vm.program("a").is_ok());
        assert!(vm.program("b").is_ok());
        assert_eq!(vm.cached_programs(), 1);
        assert_eq!(vm.program("a").expect("recompiled").len(), 1);
    }

    #[test]
    fn library_registers_both_forms() {
        let mut vm = EffectVm::new(EffectsConfig::default());
        let count = vm
            .load_library(
                r#"
                [effects]
                ring = { flat = { particle = "FLAME", points = 4, radius = 1.0 } }
                dot = { script = "display(DUST, baseX, baseY, baseZ)" }
                "#,
            )
            .expect("library");
        assert_eq!(count, 2);

        let mut host = canvas();
        assert!(vm.start(request(PlayerId::new(), "ring", EffectMode::Once)));
        vm.tick(&mut host);
        assert_eq!(host.points.len(), 4);
        let first = &host.points[0].1;
        assert!((first.x - 11.0).abs() < 1e-9);
        assert!((first.z + 5.0).abs() < 1e-9);
    }
}
