//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; binaries and tests decide where
//! they go. `RUST_LOG` always wins over the level derived from `DebugLevel`.

use tracing_subscriber::EnvFilter;

use crate::config::DebugLevel;
use crate::errors::{Result, TetherError};

fn filter_for(level: DebugLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Install a global fmt subscriber for the given verbosity
///
/// Fails if a global subscriber is already installed.
pub fn init(level: DebugLevel) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .try_init()
        .map_err(|e| TetherError::internal(format!("tracing already initialised: {e}")))
}

/// Install a test-writer subscriber, ignoring an already installed one
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(DebugLevel::All))
        .with_test_writer()
        .try_init();
}
