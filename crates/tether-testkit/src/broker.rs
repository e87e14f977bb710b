//! Scripted signaling broker
//!
//! Records what a peer asks of the broker and lets the test play the broker's
//! side: assign identities, hand over inbound channels and report errors.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_core::{
    BrokerError, BrokerEvents, DataChannel, PeerConfig, PeerId, Registration, SignalingBroker,
};

use crate::channel::ScriptedChannel;
use crate::fixtures::peer_id;

#[derive(Default)]
struct Script {
    events: Mutex<Option<Arc<dyn BrokerEvents>>>,
    config: Mutex<Option<PeerConfig>>,
    reject: Mutex<Option<BrokerError>>,
    outbound: Mutex<Vec<Arc<ScriptedChannel>>>,
    disconnected: AtomicBool,
}

/// Broker driven by the test; serves a single registration
#[derive(Clone, Default)]
pub struct ScriptedBroker {
    script: Arc<Script>,
}

impl ScriptedBroker {
    /// Create a broker with nothing registered
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> Arc<dyn BrokerEvents> {
        self.script
            .events
            .lock()
            .clone()
            .expect("no peer registered with the scripted broker")
    }

    /// Fail the next registration with `error`
    pub fn reject_with(&self, error: BrokerError) {
        *self.script.reject.lock() = Some(error);
    }

    /// Assign the identity `id` to the registered peer
    pub fn assign_id(&self, id: &str) {
        self.events().on_open(peer_id(id));
    }

    /// Hand an inbound channel to the registered peer
    pub fn deliver_connection(&self, channel: Arc<ScriptedChannel>) {
        self.events().on_connection(channel);
    }

    /// Report a broker error to the registered peer
    pub fn report_error(&self, error: BrokerError) {
        self.events().on_error(error);
    }

    /// Configuration the peer registered with
    pub fn registered_config(&self) -> Option<PeerConfig> {
        self.script.config.lock().clone()
    }

    /// Channels created by `connect`, in order
    pub fn outbound(&self) -> Vec<Arc<ScriptedChannel>> {
        self.script.outbound.lock().clone()
    }

    /// Most recent channel created by `connect`
    pub fn last_outbound(&self) -> Option<Arc<ScriptedChannel>> {
        self.script.outbound.lock().last().cloned()
    }

    /// Whether the registration was ended
    pub fn is_disconnected(&self) -> bool {
        self.script.disconnected.load(Ordering::SeqCst)
    }
}

impl SignalingBroker for ScriptedBroker {
    fn register(
        &self,
        config: &PeerConfig,
        events: Arc<dyn BrokerEvents>,
    ) -> Result<Arc<dyn Registration>, BrokerError> {
        if let Some(error) = self.script.reject.lock().take() {
            return Err(error);
        }
        *self.script.events.lock() = Some(events);
        *self.script.config.lock() = Some(config.clone());
        Ok(Arc::new(ScriptedRegistration {
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedRegistration {
    script: Arc<Script>,
}

impl Registration for ScriptedRegistration {
    fn connect(&self, remote: &PeerId) -> Result<Arc<dyn DataChannel>, BrokerError> {
        if self.script.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected);
        }
        let channel = ScriptedChannel::with_peer(remote.clone());
        self.script.outbound.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn disconnect(&self) {
        self.script.disconnected.store(true, Ordering::SeqCst);
    }
}
