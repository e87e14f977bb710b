//! Signaling broker interface
//!
//! A broker assigns identities to registered peers and relays connection
//! requests between peers that do not yet share a direct channel. Registration
//! is synchronous; the identity assignment that follows is reported later
//! through `BrokerEvents::on_open`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::PeerConfig;
use crate::effects::channel::DataChannel;
use crate::identifiers::PeerId;

/// Errors reported by a signaling broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached
    #[error("broker unreachable: {reason}")]
    Unreachable {
        /// Reason for the failure
        reason: String,
    },

    /// The broker rejected the credential
    #[error("invalid broker key")]
    InvalidKey,

    /// The requested identity is already registered
    #[error("peer id {0} is already taken")]
    IdTaken(PeerId),

    /// A connection was requested to an identity the broker does not know
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerId),

    /// The registration is no longer active
    #[error("registration is closed")]
    Disconnected,

    /// Any other broker error, tagged with the broker's error type
    #[error("[{kind}] {message}")]
    Other {
        /// Broker error category
        kind: String,
        /// Human readable detail
        message: String,
    },
}

impl BrokerError {
    /// Whether this error ends the registration before an identity is assigned
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::InvalidKey | Self::IdTaken(_) | Self::Disconnected
        )
    }
}

/// Notification handler for one registration
///
/// Every method is called from the broker's event loop and must return
/// without blocking.
pub trait BrokerEvents: Send + Sync {
    /// The broker assigned an identity to this peer
    fn on_open(&self, id: PeerId);

    /// A remote peer opened a channel to this peer
    fn on_connection(&self, channel: Arc<dyn DataChannel>);

    /// The broker reported an error for this registration
    fn on_error(&self, error: BrokerError);
}

/// A signaling broker that peers register with
pub trait SignalingBroker: Send + Sync {
    /// Register a peer; identity assignment is reported through `events`
    fn register(
        &self,
        config: &PeerConfig,
        events: Arc<dyn BrokerEvents>,
    ) -> Result<Arc<dyn Registration>, BrokerError>;
}

/// An active registration with a broker
pub trait Registration: Send + Sync {
    /// Request a channel to a remote identity
    ///
    /// Returns immediately with a channel that is still negotiating; its
    /// progress is reported through the handler bound to it.
    fn connect(&self, remote: &PeerId) -> Result<Arc<dyn DataChannel>, BrokerError>;

    /// Leave the broker; no further notifications are delivered
    fn disconnect(&self);
}
