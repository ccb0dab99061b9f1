//! # Questline Core Library
//!
//! Host-agnostic quest progression engine for multiplayer game servers.
//!
//! A quest is a graph of nodes grouped into branches. Each player runs
//! their active quests through a [`QuestEngine`], which interprets nodes
//! tick by tick, waits on world events, menus and prompts, and keeps the
//! player's progress in a write-behind cache:
//!
//! - **Definitions**: immutable, hot-swappable quest graphs ([`definition`])
//! - **Interpreter**: cursors, goto resolution, groups, menus ([`script`])
//! - **State**: per-player progress, variables, pools ([`state`])
//! - **Persistence**: versioned dirty tracking and an off-thread SQLite
//!   writer ([`cache`], [`writer`], [`persistence`])
//!
//! ## Performance Contract
//!
//! The interpreter never blocks the tick loop:
//! - Node execution is bounded per session per tick
//!   (`interpreter.max_steps_per_tick`)
//! - All delays are scheduled tasks, never sleeps
//! - Player saves run on a dedicated worker thread

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod expr;
pub mod host;
pub mod metrics;
pub mod persistence;
pub mod primitives;
pub mod scheduler;
pub mod script;
pub mod state;
pub mod types;
pub mod writer;

pub use cache::{PlayerCache, WriteCompletion, WriteRequest};
pub use config::QuestlineConfig;
pub use definition::{DefinitionRegistry, QuestDefinition};
pub use error::{QuestError, Result};
pub use events::WorldEvent;
pub use host::{Capabilities, Host};
pub use script::{ObjectiveDetail, QuestEngine};
pub use state::{PlayerState, QuestProgress};
pub use types::*;
