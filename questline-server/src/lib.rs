//! # questline-server: Game-Server Integration for Questline
//!
//! This crate wires the host-agnostic `questline-core` engine and the
//! `questline-fx` effect VM into a game server's main loop.
//!
//! ## Architecture
//!
//! ```text
//!   server listeners
//!          │
//!          ▼
//!        hooks ──► QuestServer::tick()
//!                        │
//!         ┌──────────────┼───────────────┐
//!         ▼              ▼               ▼
//!    QuestEngine      EffectVm      persistence
//!  (questline-core) (questline-fx)     worker
//! ```
//!
//! ## Modules
//!
//! - `config`: engine sections plus the `[server]` table
//! - `telemetry`: tracing subscriber setup
//! - `content`: definition files with a database-cache fallback
//! - `hooks`: raw server events to engine events
//! - `runtime`: the per-tick systems and shutdown

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod content;
pub mod hooks;
pub mod runtime;
pub mod telemetry;

pub use config::ServerConfig;
pub use runtime::QuestServer;
