//! Property-based tests for write-behind consistency and session cleanup.

use proptest::prelude::*;
use serde_json::{Map, Value, json};

use questline_core::cache::WriteCompletion;
use questline_core::definition::VarScope;
use questline_core::host::NullHost;
use questline_core::persistence::{MemoryStore, PlayerStore};
use questline_core::{
    Capabilities, PlayerId, QuestDefinition, QuestEngine, QuestError, QuestId, QuestlineConfig, WriteRequest,
};

#[derive(Debug, Clone)]
enum Op {
    Set(usize, u32),
    Flush,
    Complete(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..3usize, any::<u32>()).prop_map(|(k, v)| Op::Set(k, v)),
        2 => Just(Op::Flush),
        2 => any::<usize>().prop_map(Op::Complete),
    ]
}

fn save(store: &MemoryStore, request: &WriteRequest) -> WriteCompletion {
    let result = match request {
        WriteRequest::Player { state, version } => store.save_player(state, *version),
        WriteRequest::ServerVar { key, value, .. } => store.save_server_var(key, value.as_deref()),
    };
    WriteCompletion {
        target: request.target(),
        version: request.version(),
        ok: result.is_ok(),
    }
}

fn graph_quest(nodes: &[(u8, Option<usize>)]) -> QuestDefinition {
    let mut map = Map::new();
    for (i, (kind, target)) in nodes.iter().enumerate() {
        let goto = match target {
            Some(t) => format!("n{}", t % nodes.len()),
            None => "end:success".to_string(),
        };
        let node = match kind % 4 {
            0 => json!({ "type": "objective", "goto": goto }),
            1 => json!({ "type": "none", "goto": goto, "delay": 2 }),
            2 => json!({ "type": "message", "text": "hi", "goto": goto }),
            _ => json!({ "type": "actions", "goto": goto, "instructions": [
                { "type": "wait", "ticks": 3 },
                { "type": "message", "text": "later" }
            ]}),
        };
        map.insert(format!("n{i}"), node);
    }
    serde_json::from_value(json!({
        "id": "graph",
        "branches": { "main": { "start": "n0", "nodes": Value::Object(map) } }
    }))
    .expect("graph quest")
}

proptest! {
    #[test]
    fn write_behind_never_loses_updates(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let store = MemoryStore::new();
        let mut engine = QuestEngine::new(QuestlineConfig::default(), Box::new(store.clone()), Capabilities::default())
            .expect("engine");
        let player = PlayerId::new();
        let mut model: [Option<u32>; 3] = [None; 3];
        let mut in_flight: Vec<WriteCompletion> = Vec::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    engine
                        .set_variable(player, None, VarScope::User, &format!("k{k}"), Some(v.to_string()))
                        .expect("set");
                    model[k] = Some(v);
                }
                Op::Flush => {
                    for request in engine.collect_dirty() {
                        in_flight.push(save(&store, &request));
                    }
                }
                Op::Complete(i) => {
                    if !in_flight.is_empty() {
                        let completion = in_flight.remove(i % in_flight.len());
                        engine.apply_completion(&completion);
                    }
                }
            }
        }
        for completion in in_flight.drain(..) {
            engine.apply_completion(&completion);
        }
        engine.flush_sync().expect("flush");
        prop_assert!(!engine.is_dirty(player));

        let saved = store.stored(player).map(|(state, _)| state.user_vars).unwrap_or_default();
        for (k, expected) in model.iter().enumerate() {
            let key = format!("k{k}");
            prop_assert_eq!(saved.get(&key).cloned(), expected.map(|v| v.to_string()));
        }
    }

    #[test]
    fn stop_leaves_nothing_scheduled(
        nodes in prop::collection::vec((any::<u8>(), prop::option::of(0..8usize)), 1..8),
        ticks in 0..6usize,
    ) {
        let store = MemoryStore::new();
        let mut engine = QuestEngine::new(QuestlineConfig::default(), Box::new(store), Capabilities::default())
            .expect("engine")
            .with_seed(3);
        let report = engine.reload_definitions(vec![graph_quest(&nodes)]);
        prop_assert_eq!(report.loaded, 1);

        let mut host = NullHost;
        let player = PlayerId::new();
        let id = QuestId::from("graph");
        engine.start_quest(player, &id, &mut host).expect("start");
        for _ in 0..ticks {
            engine.tick(&mut host);
        }
        match engine.stop_quest(player, &id, &mut host) {
            Ok(()) | Err(QuestError::NotActive(_)) => {}
            Err(e) => prop_assert!(false, "unexpected error: {e}"),
        }

        prop_assert_eq!(engine.scheduled_count(), 0);
        prop_assert_eq!(engine.tokens_for(player), 0);
        prop_assert!(!engine.has_session(player, &id));
        prop_assert!(engine.active_quests(player).is_empty());
    }
}
