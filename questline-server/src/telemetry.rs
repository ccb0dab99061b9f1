//! Tracing subscriber setup.
//!
//! The filter starts from `general.log_level` and is overridden by
//! `RUST_LOG` when set. Installing twice is harmless: the second call
//! reports `false` and leaves the first subscriber in place.

use tracing_subscriber::EnvFilter;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a human-readable subscriber. Returns whether it was installed.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a JSON-lines subscriber. Returns whether it was installed.
pub fn init_json(level: &str) -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(level))
        .with_current_span(true)
        .try_init()
        .is_ok()
}
