//! Effects started by quest instructions and torn down with the quest.

use serde_json::json;

use questline_core::persistence::MemoryStore;
use questline_core::types::Location;
use questline_core::{Capabilities, Host, PlayerId, QuestDefinition, QuestEngine, QuestId, QuestlineConfig};
use questline_fx::{EffectSource, EffectVm};

#[derive(Default)]
struct Canvas {
    particles: usize,
}

impl Host for Canvas {
    fn location_of(&self, _player: PlayerId) -> Option<Location> {
        Some(Location::new("world", 0.0, 70.0, 0.0))
    }
    fn display_particle(&mut self, _player: PlayerId, _particle: &str, _at: &Location, _count: u32) {
        self.particles += 1;
    }
}

#[test]
fn quest_effects_stop_with_the_quest() {
    let config = QuestlineConfig::default();
    let mut vm = EffectVm::new(config.effects.clone());
    vm.register("spark", EffectSource::Script("display(SPARK, baseX, baseY + 2, baseZ) wait(1)".into()));
    let caps = Capabilities {
        effects: Some(Box::new(vm)),
        ..Capabilities::default()
    };
    let mut engine = QuestEngine::new(config, Box::new(MemoryStore::new()), caps).expect("engine");
    let def: QuestDefinition = serde_json::from_value(json!({
        "id": "glow",
        "branches": { "main": { "start": "a", "nodes": {
            "a": { "type": "actions", "goto": "b", "instructions": [
                { "type": "effect", "effect": "spark", "mode": "repeat" }
            ]},
            "b": { "type": "objective" }
        }}}
    }))
    .expect("quest json");
    assert_eq!(engine.reload_definitions(vec![def]).loaded, 1);

    let mut host = Canvas::default();
    let player = PlayerId::new();
    let id = QuestId::from("glow");
    engine.start_quest(player, &id, &mut host).expect("start");
    for _ in 0..4 {
        engine.tick(&mut host);
    }
    let shown = host.particles;
    assert!(shown >= 2, "repeating effect renders while the quest runs");

    engine.stop_quest(player, &id, &mut host).expect("stop");
    for _ in 0..4 {
        engine.tick(&mut host);
    }
    assert_eq!(host.particles, shown);
}
