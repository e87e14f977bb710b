//! Collaborator interfaces
//!
//! This module defines the interfaces tether expects from the outside world:
//! a signaling broker that assigns identities and relays connection requests,
//! and a data channel library that carries discrete binary messages between
//! two peers.
//!
//! # Event delivery contract
//!
//! Implementations deliver every notification (`BrokerEvents`,
//! `ChannelEvents`) from a single cooperative event loop. Handlers never
//! block: they record state, wake suspended callers and return. Conversely,
//! implementations must not hold internal locks while invoking a handler, and
//! must never call handlers from inside `connect`, `send` or `close`.

pub mod channel;
pub mod signaling;

pub use channel::{ChannelError, ChannelEvent, ChannelEvents, DataChannel};
pub use signaling::{BrokerError, BrokerEvents, Registration, SignalingBroker};
