//! Questline benchmark suite.
//!
//! Tick-budget targets at 20 TPS:
//!   interpreter_tick_500_players ...... < 2ms
//!   expression_eval_compiled .......... < 1μs
//!   cache_collect_dirty_1000 .......... < 1ms
//!   effect_tick_100_runs .............. < 500μs

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;

use questline_core::definition::{EffectMode, VarScope};
use questline_core::expr::{Expr, VarRef};
use questline_core::host::{EffectRequest, EffectRunner, NullHost};
use questline_core::persistence::MemoryStore;
use questline_core::types::Location;
use questline_core::{Capabilities, Host, PlayerId, QuestDefinition, QuestEngine, QuestId, QuestlineConfig};
use questline_fx::{EffectSource, EffectVm};

struct Sink;

impl Host for Sink {
    fn location_of(&self, _player: PlayerId) -> Option<Location> {
        Some(Location::new("world", 0.0, 64.0, 0.0))
    }
}

fn patrol_quest() -> QuestDefinition {
    serde_json::from_value(json!({
        "id": "patrol",
        "branches": { "main": { "start": "a", "nodes": {
            "a": { "type": "message", "text": "Keep walking", "goto": "b" },
            "b": { "type": "none", "delay": 1, "goto": "a" }
        }}}
    }))
    .unwrap()
}

fn engine(store: MemoryStore) -> QuestEngine {
    QuestEngine::new(QuestlineConfig::default(), Box::new(store), Capabilities::default()).unwrap()
}

/// Benchmark: one interpreter tick with 500 players on a looping quest.
fn bench_interpreter_tick(c: &mut Criterion) {
    let mut engine = engine(MemoryStore::new());
    engine.reload_definitions(vec![patrol_quest()]);
    let mut host = NullHost;
    let id = QuestId::from("patrol");
    for _ in 0..500 {
        engine.start_quest(PlayerId::new(), &id, &mut host).unwrap();
    }

    c.bench_function("interpreter_tick_500_players", |b| {
        b.iter(|| black_box(engine.tick(&mut host)));
    });
}

/// Benchmark: evaluating a pre-compiled expression.
fn bench_expression(c: &mut Criterion) {
    let expr = Expr::compile("baseX + sin(i * 0.5) * radius").unwrap();
    let vars = |v: &VarRef| match v.name.as_str() {
        "baseX" => Some(12.0),
        "i" => Some(3.0),
        "radius" => Some(2.5),
        _ => None,
    };

    c.bench_function("expression_eval_compiled", |b| {
        b.iter(|| black_box(expr.eval_or_zero(black_box(&vars))));
    });
}

/// Benchmark: collecting write-behind snapshots for 1000 dirty players.
fn bench_collect_dirty(c: &mut Criterion) {
    let mut engine = engine(MemoryStore::new());
    let players: Vec<PlayerId> = (0..1000).map(|_| PlayerId::new()).collect();

    c.bench_function("cache_collect_dirty_1000", |b| {
        b.iter(|| {
            for (i, player) in players.iter().enumerate() {
                engine
                    .set_variable(*player, None, VarScope::User, "steps", Some(i.to_string()))
                    .unwrap();
            }
            black_box(engine.collect_dirty());
        });
    });
}

/// Benchmark: one effect VM tick with 100 repeating runs.
fn bench_effect_tick(c: &mut Criterion) {
    let config = QuestlineConfig::default();
    let mut vm = EffectVm::new(config.effects);
    vm.register(
        "halo",
        EffectSource::Script(
            "loop(i, 0, 7)\n  display(END_ROD, baseX + cos(i * 0.785) * 2, baseY + 1, baseZ + sin(i * 0.785) * 2)\nend\nwait(1)"
                .into(),
        ),
    );
    let quest = QuestId::from("halo");
    for _ in 0..100 {
        vm.start(EffectRequest {
            player: PlayerId::new(),
            quest: quest.clone(),
            effect: "halo".into(),
            mode: EffectMode::Repeat,
            anchor: None,
        });
    }
    let mut host = Sink;

    c.bench_function("effect_tick_100_runs", |b| {
        b.iter(|| vm.tick(black_box(&mut host)));
    });
}

criterion_group!(
    benches,
    bench_interpreter_tick,
    bench_expression,
    bench_collect_dirty,
    bench_effect_tick,
);
criterion_main!(benches);
