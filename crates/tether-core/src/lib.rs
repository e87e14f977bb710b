//! Tether Core - shared foundation for brokered peer-to-peer byte streams
//!
//! This crate holds the vocabulary every other tether crate speaks: peer and
//! session identifiers, the unified error type, peer configuration, logging
//! setup, and the collaborator interfaces a signaling broker and its data
//! channel library must implement.
//!
//! # Layers
//!
//! - `identifiers`: `PeerId`, `SessionId`
//! - `errors`: `TetherError` and the crate-wide `Result`
//! - `config`: `PeerConfig`, `DebugLevel`
//! - `logging`: `tracing-subscriber` installation
//! - `effects`: `SignalingBroker`, `Registration`, `BrokerEvents`,
//!   `DataChannel`, `ChannelEvents`
//!
//! The collaborator interfaces are synchronous on purpose: implementations
//! invoke the event handlers from their own single event loop, and handlers
//! return immediately after handing work to a suspended caller.

#![forbid(unsafe_code)]

/// Peer configuration and broker verbosity
pub mod config;

/// Broker and data-channel collaborator interfaces
pub mod effects;

/// Unified error handling
pub mod errors;

/// Peer and session identifiers
pub mod identifiers;

/// Tracing subscriber setup
pub mod logging;

pub use config::{DebugLevel, PeerConfig, DEFAULT_CONNECT_TIMEOUT};
pub use effects::{
    BrokerError, BrokerEvents, ChannelError, ChannelEvent, ChannelEvents, DataChannel,
    Registration, SignalingBroker,
};
pub use errors::{Result, TetherError};
pub use identifiers::{PeerId, SessionId};
