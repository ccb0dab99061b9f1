//! # Questline Effects
//!
//! A small, incrementally ticked interpreter for timed cosmetic effects.
//!
//! Effects are registered by id as either a declarative ring
//! ([`FlatEffect`]) or a line-form script, compiled lazily into flat
//! instruction lists ([`Program`]) and kept in an LRU cache. [`EffectVm`]
//! implements the core's [`EffectRunner`](questline_core::host::EffectRunner)
//! so quests start effects through their `effect` instruction.
//!
//! ## Performance Contract
//!
//! - Formulas are compiled once; ticks only evaluate token lists
//! - A tick executes at most `effects.global_budget` instructions
//! - No single run executes more than `effects.per_run_budget` per tick

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod program;
pub mod vm;

pub use error::{FxError, Result};
pub use program::{EffectSource, FlatEffect, Instr, Program};
pub use vm::EffectVm;
