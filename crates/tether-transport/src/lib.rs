//! Tether Transport - RPC byte streams over brokered peer-to-peer channels
//!
//! Data channel libraries are event driven: they report "open", "data",
//! "close" and "error" through callbacks on their own event loop. RPC layers
//! want a byte stream they can read from and write to, suspending until the
//! channel is ready. This crate bridges the two.
//!
//! - [`Peer`] registers with a signaling broker, learns its identity, opens
//!   outbound sessions and routes inbound ones to a [`Listener`].
//! - [`Session`] turns one data channel into a suspending byte stream.
//! - [`SessionStream`] and [`BlockingStream`] plug a session into tokio or
//!   `std::io` based RPC code.
//! - [`MemoryBroker`] is an in-process broker for tests and local setups;
//!   [`websocket`] carries sessions over plain WebSocket connections.
//!
//! Every `write` becomes exactly one channel message. RPC codecs should emit
//! one whole frame per write.

#![forbid(unsafe_code)]

/// Session, listener and peer errors
pub mod error;

/// Inbound session queue
pub mod listener;

/// In-process signaling broker
pub mod memory;

/// Broker registration and session factory
pub mod peer;

/// Data channel to byte stream bridge
pub mod session;

/// `AsyncRead`/`AsyncWrite` and `Read`/`Write` adapters
pub mod stream;

/// WebSocket-backed sessions
pub mod websocket;

pub use error::{ListenerError, PeerError, SessionError};
pub use listener::Listener;
pub use memory::{MemoryBroker, MemoryBrokerOptions};
pub use peer::Peer;
pub use session::{Direction, Session, SessionState, SessionStats};
pub use stream::{BlockingStream, SessionStream};
pub use websocket::{dial, WebSocketConfig, WebSocketError, WebSocketListener};
