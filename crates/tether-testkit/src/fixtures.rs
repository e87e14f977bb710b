//! Common fixtures

use tether_core::{DebugLevel, PeerConfig, PeerId};

/// Peer configuration with defaults and full broker verbosity
pub fn test_config() -> PeerConfig {
    PeerConfig::new().with_debug(DebugLevel::All)
}

/// Build a peer id, panicking on blank input
pub fn peer_id(name: &str) -> PeerId {
    PeerId::new(name).expect("test peer id must not be blank")
}

/// Route `tracing` output to the test harness
pub fn init_test_logging() {
    tether_core::logging::try_init_for_tests();
}
