//! Start preconditions. Checked before anything is mutated.

use chrono::{DateTime, Utc};

use crate::definition::QuestDefinition;
use crate::error::{QuestError, Result};
use crate::host::Host;
use crate::state::PlayerState;
use crate::types::PlayerId;

/// Check every start precondition in a fixed order: already active,
/// completion limit, cooldown, permission, world, prerequisites, then the
/// global active-quest limit (`max_active`, 0 = unlimited).
///
/// # Errors
/// The first failing precondition.
pub(crate) fn check_start(
    def: &QuestDefinition,
    state: &PlayerState,
    host: &dyn Host,
    player: PlayerId,
    now: DateTime<Utc>,
    max_active: usize,
) -> Result<()> {
    let quest = &def.id;
    let req = &def.requirements;

    if state.is_active(quest) {
        return Err(QuestError::AlreadyActive(quest.clone()));
    }

    if let Some(limit) = req.max_completions {
        if state.completion_count(quest) >= limit {
            return Err(QuestError::CompletionLimit {
                quest: quest.clone(),
                limit,
            });
        }
    }

    if let (Some(cooldown), Some(last)) = (req.cooldown_secs, state.last_completed.get(quest)) {
        let remaining = cooldown - (now - *last).num_seconds();
        if remaining > 0 {
            return Err(QuestError::Cooldown {
                quest: quest.clone(),
                remaining_secs: remaining,
            });
        }
    }

    if let Some(permission) = &req.permission {
        if !host.has_permission(player, permission) {
            return Err(QuestError::PermissionDenied {
                permission: permission.clone(),
            });
        }
    }

    if !req.worlds.is_empty() {
        let world = host.location_of(player).map(|l| l.world).unwrap_or_default();
        if !req.worlds.iter().any(|w| w.eq_ignore_ascii_case(&world)) {
            return Err(QuestError::WorldRestricted {
                quest: quest.clone(),
                world,
            });
        }
    }

    if let Some(missing) = req.prerequisites.iter().find(|p| !state.has_completed(p)) {
        return Err(QuestError::MissingPrerequisite {
            quest: quest.clone(),
            missing: missing.clone(),
        });
    }

    if max_active > 0 && state.active.len() >= max_active {
        return Err(QuestError::TooManyActive { limit: max_active });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHost;
    use crate::types::{Location, QuestId};

    struct Denied;
    impl Host for Denied {
        fn has_permission(&self, _p: PlayerId, _perm: &str) -> bool {
            false
        }
        fn location_of(&self, _p: PlayerId) -> Option<Location> {
            Some(Location::new("nether", 0.0, 0.0, 0.0))
        }
    }

    #[test]
    fn completion_limit_and_cooldown() {
        let mut def = QuestDefinition::new("daily");
        def.requirements.max_completions = Some(2);
        def.requirements.cooldown_secs = Some(60);
        let mut state = PlayerState::new(PlayerId::new());
        let now = Utc::now();

        state.record_completion(&def.id, now);
        let err = check_start(&def, &state, &NullHost, state.player, now, 0).expect_err("cooldown");
        assert!(matches!(err, QuestError::Cooldown { remaining_secs: 60, .. }));
        let later = now + chrono::Duration::seconds(61);
        check_start(&def, &state, &NullHost, state.player, later, 0).expect("cooldown over");

        state.record_completion(&def.id, now);
        let err = check_start(&def, &state, &NullHost, state.player, later, 0).expect_err("limit");
        assert!(matches!(err, QuestError::CompletionLimit { limit: 2, .. }));
    }

    #[test]
    fn permission_checked_before_world_and_prerequisites() {
        let mut def = QuestDefinition::new("guarded");
        def.requirements.permission = Some("quests.guarded".into());
        def.requirements.worlds = vec!["world".into()];
        def.requirements.prerequisites = vec![QuestId::from("intro")];
        let state = PlayerState::new(PlayerId::new());

        let err = check_start(&def, &state, &Denied, state.player, Utc::now(), 0).expect_err("perm");
        assert!(matches!(err, QuestError::PermissionDenied { .. }));

        def.requirements.permission = None;
        let err = check_start(&def, &state, &Denied, state.player, Utc::now(), 0).expect_err("world");
        assert!(matches!(err, QuestError::WorldRestricted { ref world, .. } if world == "nether"));

        def.requirements.worlds.clear();
        let err = check_start(&def, &state, &Denied, state.player, Utc::now(), 0).expect_err("prereq");
        assert!(matches!(err, QuestError::MissingPrerequisite { .. }));
    }
}
