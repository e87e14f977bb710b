//! Data channel interface
//!
//! A data channel is a message-oriented, ordered, reliable pipe to one remote
//! peer. It is created by a `Registration` (outbound) or handed to
//! `BrokerEvents::on_connection` (inbound), and reports its lifecycle through
//! the `ChannelEvents` handler bound to it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::identifiers::PeerId;

/// Errors reported by a data channel library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ChannelError {
    /// The channel is not open (yet, or anymore)
    #[error("channel is not open")]
    NotOpen,

    /// Negotiation with the remote peer failed
    #[error("negotiation failed: {reason}")]
    Negotiation {
        /// Library-provided reason
        reason: String,
    },

    /// The connection dropped underneath the channel
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Library-provided reason
        reason: String,
    },

    /// Any other library error, tagged with the library's error type
    #[error("[{kind}] {message}")]
    Other {
        /// Library error category
        kind: String,
        /// Human readable detail
        message: String,
    },
}

impl ChannelError {
    /// Create a library error with a category tag
    pub fn other(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Other {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a connection-lost error
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }
}

/// One notification from a data channel
///
/// Useful for implementations that queue notifications before a handler is
/// bound, and for replaying scripted event sequences in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is ready to carry messages
    Open,
    /// One message arrived
    Data(Bytes),
    /// The channel closed
    Close,
    /// The channel failed
    Error(ChannelError),
}

impl ChannelEvent {
    /// Dispatch this notification to a handler
    pub fn deliver(self, events: &dyn ChannelEvents) {
        match self {
            Self::Open => events.on_open(),
            Self::Data(payload) => events.on_data(payload),
            Self::Close => events.on_close(),
            Self::Error(error) => events.on_error(error),
        }
    }
}

/// Notification handler bound to a data channel
///
/// Every method is called from the channel library's event loop and must
/// return without blocking.
pub trait ChannelEvents: Send + Sync {
    /// The channel finished negotiating and can carry messages
    fn on_open(&self);

    /// One discrete message arrived
    fn on_data(&self, payload: Bytes);

    /// The channel closed, locally or remotely
    fn on_close(&self);

    /// The channel failed
    fn on_error(&self, error: ChannelError);
}

/// Handle to one data channel owned by the channel library
pub trait DataChannel: Send + Sync {
    /// Identity of the peer on the other end
    fn remote_peer(&self) -> &PeerId;

    /// Install the notification handler
    ///
    /// Notifications raised before a handler is bound are held and delivered
    /// once it is installed, in order.
    fn bind(&self, events: Arc<dyn ChannelEvents>);

    /// Queue one message for delivery as a single discrete unit
    fn send(&self, payload: Bytes) -> Result<(), ChannelError>;

    /// Request closure; completion is reported through `on_close`
    fn close(&self);
}
