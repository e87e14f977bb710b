//! Transport errors
//!
//! Every terminal condition of a session is recorded once and handed out
//! verbatim to each caller that observes it, so all error types here are
//! `Clone`.

use std::io;
use std::time::Duration;

use tether_core::{BrokerError, ChannelError, PeerId, TetherError};

/// Terminal condition of a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The channel did not open before the connect deadline
    #[error("connection to {peer} timed out after {after:?}")]
    Timeout {
        /// Remote peer
        peer: PeerId,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The channel library reported a failure
    #[error("channel to {peer} failed: {source}")]
    Channel {
        /// Remote peer
        peer: PeerId,
        /// Library error
        source: ChannelError,
    },

    /// The broker does not know the remote identity
    #[error("peer {peer} is unavailable")]
    PeerUnavailable {
        /// Remote peer
        peer: PeerId,
    },

    /// The session closed, locally or remotely
    #[error("connection to {peer} closed")]
    Closed {
        /// Remote peer
        peer: PeerId,
    },
}

impl SessionError {
    /// Whether this is an orderly close rather than a failure
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Whether the connect deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Remote peer the failing session talked to
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::Timeout { peer, .. }
            | Self::Channel { peer, .. }
            | Self::PeerUnavailable { peer }
            | Self::Closed { peer } => peer,
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Timeout { .. } => io::ErrorKind::TimedOut,
            Self::Channel {
                source: ChannelError::NotOpen,
                ..
            }
            | Self::PeerUnavailable { .. } => io::ErrorKind::NotConnected,
            Self::Channel {
                source: ChannelError::ConnectionLost { .. },
                ..
            } => io::ErrorKind::ConnectionReset,
            Self::Channel { .. } | Self::Closed { .. } => io::ErrorKind::BrokenPipe,
        }
    }
}

impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

/// Errors returned by `Listener::accept`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    /// The listener was closed and no sessions remain queued
    #[error("listener closed")]
    Closed,
}

/// Errors returned by `Peer` operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    /// The peer configuration is invalid
    #[error(transparent)]
    Config(#[from] TetherError),

    /// The broker rejected a request
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Registration failed before an identity was assigned
    #[error("registration failed: {0}")]
    Registration(BrokerError),

    /// A listener is already accepting inbound sessions for this peer
    #[error("peer is already listening")]
    AlreadyListening,

    /// No tokio runtime is available to drive connect deadlines
    #[error("no tokio runtime available")]
    NoRuntime,
}
