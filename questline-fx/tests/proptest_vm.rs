//! Property tests for loop semantics and tick budgets.

use proptest::prelude::*;

use questline_core::config::EffectsConfig;
use questline_core::definition::EffectMode;
use questline_core::host::{EffectRequest, EffectRunner};
use questline_core::types::Location;
use questline_core::{Host, PlayerId, QuestId};
use questline_fx::{EffectSource, EffectVm};

#[derive(Default)]
struct Counter {
    displays: usize,
}

impl Host for Counter {
    fn location_of(&self, _player: PlayerId) -> Option<Location> {
        Some(Location::default())
    }
    fn display_particle(&mut self, _player: PlayerId, _particle: &str, _at: &Location, _count: u32) {
        self.displays += 1;
    }
}

fn start(vm: &mut EffectVm, effect: &str) -> bool {
    vm.start(EffectRequest {
        player: PlayerId::new(),
        quest: QuestId::from("q"),
        effect: effect.to_string(),
        mode: EffectMode::Once,
        anchor: None,
    })
}

proptest! {
    #[test]
    fn inclusive_loops_visit_every_step(start_at in -20i32..20, end_at in -20i32..20, step in 1i32..4) {
        let mut vm = EffectVm::new(EffectsConfig::default());
        vm.register(
            "fx",
            EffectSource::Script(format!("loop(i, {start_at}, {end_at}, {step}) display(A, i, 0, 0) end")),
        );
        prop_assert!(start(&mut vm, "fx"));
        let mut host = Counter::default();
        vm.tick(&mut host);

        let expected = if end_at >= start_at {
            usize::try_from((end_at - start_at) / step + 1).expect("non-negative")
        } else {
            0
        };
        prop_assert_eq!(host.displays, expected);
        prop_assert_eq!(vm.active_runs(), 0);
    }

    #[test]
    fn ticks_never_exceed_budgets(global in 1u32..60, per_run in 1u32..20, runs in 1usize..6) {
        let config = EffectsConfig {
            global_budget: global,
            per_run_budget: per_run,
            max_runs_per_player: 0,
            ..EffectsConfig::default()
        };
        let mut vm = EffectVm::new(config);
        vm.register("fx", EffectSource::Script("loop(i, 0, 100000) display(A, i, 0, 0) end".into()));
        for _ in 0..runs {
            prop_assert!(start(&mut vm, "fx"));
        }
        let mut host = Counter::default();
        let cap = u32::try_from(runs).expect("small") * per_run;
        for _ in 0..5 {
            vm.tick(&mut host);
            prop_assert!(vm.executed_last_tick() <= global);
            prop_assert_eq!(vm.executed_last_tick(), global.min(cap));
        }
    }
}
