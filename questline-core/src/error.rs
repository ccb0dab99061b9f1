//! Error types for the Questline core library.

use thiserror::Error;

use crate::types::{PlayerId, QuestId};

/// Top-level error type for all Questline operations.
///
/// Variants fall into four families: precondition failures (returned to the
/// caller with no side effects applied), content errors (logged and degraded
/// by the interpreter), runtime faults, and configuration problems.
#[derive(Error, Debug)]
pub enum QuestError {
    /// No definition is registered under this id.
    #[error("Unknown quest: {0}")]
    UnknownQuest(QuestId),

    /// The quest is already running for this player.
    #[error("Quest already active: {0}")]
    AlreadyActive(QuestId),

    /// The quest is not running for this player.
    #[error("Quest not active: {0}")]
    NotActive(QuestId),

    /// The player has completed the quest the maximum number of times.
    #[error("Completion limit reached for {quest} (limit: {limit})")]
    CompletionLimit {
        /// Quest being started.
        quest: QuestId,
        /// Configured maximum completions.
        limit: u32,
    },

    /// The player lacks the permission node required by the quest.
    #[error("Permission denied: {permission}")]
    PermissionDenied {
        /// Missing permission node.
        permission: String,
    },

    /// The quest was completed too recently.
    #[error("Quest {quest} on cooldown for {remaining_secs}s")]
    Cooldown {
        /// Quest being started.
        quest: QuestId,
        /// Seconds until the quest may be started again.
        remaining_secs: i64,
    },

    /// The player is in a world the quest does not allow.
    #[error("Quest {quest} cannot be started in world '{world}'")]
    WorldRestricted {
        /// Quest being started.
        quest: QuestId,
        /// World the player is currently in.
        world: String,
    },

    /// A running quest blocks this command.
    #[error("Command '{command}' is blocked by quest {quest}")]
    CommandRestricted {
        /// Blocking quest.
        quest: QuestId,
        /// Command line that was rejected.
        command: String,
    },

    /// A prerequisite quest has not been completed.
    #[error("Quest {quest} requires {missing} to be completed first")]
    MissingPrerequisite {
        /// Quest being started.
        quest: QuestId,
        /// The prerequisite that is missing.
        missing: QuestId,
    },

    /// Too many quests are running for this player.
    #[error("Too many active quests (limit: {limit})")]
    TooManyActive {
        /// Configured maximum.
        limit: usize,
    },

    /// No live session exists for this player and quest.
    #[error("No session for player {player} in quest {quest}")]
    NoSession {
        /// Player id.
        player: PlayerId,
        /// Quest id.
        quest: QuestId,
    },

    /// A continuation token is unknown, expired or owned by someone else.
    #[error("Unknown or expired continuation token {0}")]
    UnknownToken(u64),

    /// A menu selection named a choice that is not visible.
    #[error("Choice {index} is not available")]
    InvalidChoice {
        /// Requested choice index.
        index: usize,
    },

    /// A goto or API call referenced a node that does not exist.
    #[error("Unknown node '{node}' in branch '{branch}' of quest {quest}")]
    UnknownNode {
        /// Quest id.
        quest: QuestId,
        /// Branch searched.
        branch: String,
        /// Missing node id.
        node: String,
    },

    /// A goto or API call referenced a branch that does not exist.
    #[error("Unknown branch '{branch}' in quest {quest}")]
    UnknownBranch {
        /// Quest id.
        quest: QuestId,
        /// Missing branch id.
        branch: String,
    },

    /// A definition violates a structural invariant.
    #[error("Invalid quest definition {quest}: {reason}")]
    InvalidDefinition {
        /// Quest id.
        quest: QuestId,
        /// What is wrong.
        reason: String,
    },

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The persistence worker has shut down or its queue is closed.
    #[error("Persistence worker unavailable")]
    WorkerUnavailable,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuestError {
    /// Whether this error is a precondition failure that should be shown to
    /// the player rather than logged as a fault.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::UnknownQuest(_)
                | Self::AlreadyActive(_)
                | Self::NotActive(_)
                | Self::CompletionLimit { .. }
                | Self::PermissionDenied { .. }
                | Self::Cooldown { .. }
                | Self::WorldRestricted { .. }
                | Self::CommandRestricted { .. }
                | Self::MissingPrerequisite { .. }
                | Self::TooManyActive { .. }
        )
    }

    /// Player-facing message for precondition failures.
    ///
    /// Content and runtime errors have no player channel and return `None`.
    #[must_use]
    pub fn player_message(&self) -> Option<String> {
        let msg = match self {
            Self::UnknownQuest(q) => format!("There is no quest called '{q}'."),
            Self::AlreadyActive(q) => format!("You are already doing '{q}'."),
            Self::NotActive(q) => format!("You are not doing '{q}'."),
            Self::CompletionLimit { quest, .. } => {
                format!("You cannot complete '{quest}' any more times.")
            }
            Self::PermissionDenied { .. } => "You are not allowed to start this quest.".to_string(),
            Self::Cooldown {
                quest,
                remaining_secs,
            } => format!("'{quest}' is available again in {}.", format_secs(*remaining_secs)),
            Self::WorldRestricted { quest, .. } => {
                format!("'{quest}' cannot be started in this world.")
            }
            Self::CommandRestricted { quest, .. } => {
                format!("You cannot use that command while doing '{quest}'.")
            }
            Self::MissingPrerequisite { missing, .. } => {
                format!("You must finish '{missing}' first.")
            }
            Self::TooManyActive { limit } => {
                format!("You can only have {limit} quests active at once.")
            }
            _ => return None,
        };
        Some(msg)
    }
}

fn format_secs(secs: i64) -> String {
    let secs = secs.max(0);
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, QuestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preconditions_have_player_messages() {
        let err = QuestError::Cooldown {
            quest: QuestId::from("daily"),
            remaining_secs: 3725,
        };
        assert!(err.is_precondition());
        let msg = err.player_message().expect("message");
        assert!(msg.contains("1h 2m"), "{msg}");
    }

    #[test]
    fn faults_are_silent_to_players() {
        let err = QuestError::WorkerUnavailable;
        assert!(!err.is_precondition());
        assert!(err.player_message().is_none());
    }
}
