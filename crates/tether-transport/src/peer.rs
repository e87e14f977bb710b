//! Peer: broker registration, identity and session factory
//!
//! A `Peer` registers with a signaling broker when it is created. The broker
//! assigns the identity later, so `id()` suspends until the assignment (or a
//! fatal registration error) arrives. Outbound sessions come from `connect`,
//! inbound sessions are routed to the single open `Listener`.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use tether_core::{
    BrokerError, BrokerEvents, DataChannel, PeerConfig, PeerId, Registration, SignalingBroker,
};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::listener::{AcceptQueue, Listener};
use crate::session::{Direction, Session, WeakSession};

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentityState {
    Pending,
    Assigned(PeerId),
    Failed(BrokerError),
}

struct PeerInner {
    config: PeerConfig,
    runtime: Handle,
    identity: watch::Sender<IdentityState>,
    registration: OnceLock<Arc<dyn Registration>>,
    listener: Mutex<Option<Arc<AcceptQueue>>>,
    outbound: Mutex<Vec<(PeerId, WeakSession)>>,
}

impl PeerInner {
    fn handle_open(&self, id: PeerId) {
        let assigned = self.identity.send_if_modified(|state| {
            if matches!(state, IdentityState::Pending) {
                *state = IdentityState::Assigned(id.clone());
                true
            } else {
                false
            }
        });
        if assigned {
            info!(peer = %id, "Peer registered with broker");
        } else {
            debug!(peer = %id, "Ignoring repeated identity assignment");
        }
    }

    fn handle_connection(&self, channel: Arc<dyn DataChannel>) {
        let queue = {
            let mut slot = self.listener.lock();
            if slot.as_ref().is_some_and(|queue| queue.is_closed()) {
                *slot = None;
            }
            slot.clone()
        };

        let Some(queue) = queue else {
            warn!(remote = %channel.remote_peer(), "Inbound connection with no listener, closing");
            channel.close();
            return;
        };

        let session = Session::establish(
            channel,
            Direction::Inbound,
            self.config.connect_timeout,
            &self.runtime,
        );
        debug!(session = %session.id(), remote = %session.remote_peer(), "Queued inbound connection");
        if let Err(session) = queue.push(session) {
            warn!(remote = %session.remote_peer(), "Listener closed, dropping inbound connection");
            let _ = session.close();
        }
    }

    fn handle_error(&self, error: BrokerError) {
        warn!(error = %error, "Broker error");

        if let BrokerError::PeerUnavailable(remote) = &error {
            let sessions: Vec<Session> = self
                .outbound
                .lock()
                .iter()
                .filter(|(peer, _)| peer == remote)
                .filter_map(|(_, session)| session.upgrade())
                .collect();
            for session in sessions {
                session.fail_unavailable();
            }
            return;
        }

        if error.is_fatal() {
            self.identity.send_if_modified(|state| {
                if matches!(state, IdentityState::Pending) {
                    *state = IdentityState::Failed(error.clone());
                    true
                } else {
                    false
                }
            });
        }
    }

    fn track(&self, session: &Session) {
        let mut outbound = self.outbound.lock();
        outbound.retain(|(_, weak)| weak.upgrade().is_some_and(|s| !s.state().is_terminal()));
        outbound.push((session.remote_peer().clone(), session.downgrade()));
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        if let Some(queue) = self.listener.get_mut().take() {
            queue.close();
        }
        if let Some(registration) = self.registration.get() {
            registration.disconnect();
        }
    }
}

/// Broker notification handler holding the peer weakly
struct PeerEvents {
    inner: Weak<PeerInner>,
}

impl BrokerEvents for PeerEvents {
    fn on_open(&self, id: PeerId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_open(id);
        }
    }

    fn on_connection(&self, channel: Arc<dyn DataChannel>) {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_connection(channel),
            None => channel.close(),
        }
    }

    fn on_error(&self, error: BrokerError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_error(error);
        }
    }
}

/// A registered endpoint that opens and accepts sessions
///
/// Cloning yields another handle to the same registration. The registration
/// ends when the last handle is dropped or `disconnect` is called.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Register with `broker` using the current tokio runtime
    pub fn new(config: PeerConfig, broker: &dyn SignalingBroker) -> Result<Self, PeerError> {
        let runtime = Handle::try_current().map_err(|_| PeerError::NoRuntime)?;
        Self::with_runtime(config, broker, runtime)
    }

    /// Register with `broker`, arming connect deadlines on `runtime`
    pub fn with_runtime(
        config: PeerConfig,
        broker: &dyn SignalingBroker,
        runtime: Handle,
    ) -> Result<Self, PeerError> {
        config.validate()?;

        let inner = Arc::new(PeerInner {
            config,
            runtime,
            identity: watch::Sender::new(IdentityState::Pending),
            registration: OnceLock::new(),
            listener: Mutex::new(None),
            outbound: Mutex::new(Vec::new()),
        });

        let events = Arc::new(PeerEvents {
            inner: Arc::downgrade(&inner),
        });
        let registration = broker.register(&inner.config, events)?;
        if inner.registration.set(registration).is_err() {
            debug!("Registration already installed");
        }

        debug!(requested = ?inner.config.id, "Peer registration requested");
        Ok(Self { inner })
    }

    /// Configuration this peer registered with
    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// Identity assigned by the broker
    ///
    /// Suspends until the broker assigns it; fails if registration failed.
    pub async fn id(&self) -> Result<PeerId, PeerError> {
        let mut identity = self.inner.identity.subscribe();
        let state = identity
            .wait_for(|state| !matches!(state, IdentityState::Pending))
            .await
            .map_err(|_| PeerError::Registration(BrokerError::Disconnected))?;
        match &*state {
            IdentityState::Assigned(id) => Ok(id.clone()),
            IdentityState::Failed(error) => Err(PeerError::Registration(error.clone())),
            IdentityState::Pending => Err(PeerError::Registration(BrokerError::Disconnected)),
        }
    }

    /// Identity if it is already assigned
    pub fn try_id(&self) -> Option<PeerId> {
        match &*self.inner.identity.borrow() {
            IdentityState::Assigned(id) => Some(id.clone()),
            IdentityState::Pending | IdentityState::Failed(_) => None,
        }
    }

    /// Blocking `id` for callers on plain threads
    pub fn id_blocking(&self) -> Result<PeerId, PeerError> {
        futures::executor::block_on(self.id())
    }

    /// Open a session to `remote`
    ///
    /// Returns immediately with a connecting session; writes suspend until it
    /// opens or fails.
    pub fn connect(&self, remote: &PeerId) -> Result<Session, PeerError> {
        let registration = self
            .inner
            .registration
            .get()
            .ok_or(PeerError::Broker(BrokerError::Disconnected))?;
        let channel = registration.connect(remote)?;
        let session = Session::establish(
            channel,
            Direction::Outbound,
            self.inner.config.connect_timeout,
            &self.inner.runtime,
        );
        self.inner.track(&session);
        info!(session = %session.id(), remote = %remote, "Connecting to remote peer");
        Ok(session)
    }

    /// Start accepting inbound sessions
    ///
    /// Only one listener may be open at a time; once it is closed, `listen`
    /// can be called again.
    pub fn listen(&self) -> Result<Listener, PeerError> {
        let mut slot = self.inner.listener.lock();
        if slot.as_ref().is_some_and(|queue| !queue.is_closed()) {
            return Err(PeerError::AlreadyListening);
        }
        let queue = AcceptQueue::new();
        *slot = Some(Arc::clone(&queue));
        debug!(peer = ?self.try_id(), "Listening for inbound connections");
        Ok(Listener::new(queue))
    }

    /// Leave the broker and stop accepting inbound sessions
    ///
    /// Sessions already created are not affected.
    pub fn disconnect(&self) {
        if let Some(queue) = self.inner.listener.lock().take() {
            queue.close();
        }
        if let Some(registration) = self.inner.registration.get() {
            registration.disconnect();
        }
        self.inner.identity.send_if_modified(|state| {
            if matches!(state, IdentityState::Pending) {
                *state = IdentityState::Failed(BrokerError::Disconnected);
                true
            } else {
                false
            }
        });
        info!(peer = ?self.try_id(), "Peer disconnected from broker");
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.try_id())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::session::SessionState;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tether_testkit::{peer_id, test_config, ScriptedBroker, ScriptedChannel};

    #[tokio::test]
    async fn test_new_requires_valid_config() {
        let broker = ScriptedBroker::new();
        let config = test_config().with_connect_timeout(Duration::ZERO);
        assert_matches!(Peer::new(config, &broker), Err(PeerError::Config(_)));
    }

    #[test]
    fn test_new_requires_runtime() {
        let broker = ScriptedBroker::new();
        assert_matches!(Peer::new(test_config(), &broker), Err(PeerError::NoRuntime));
    }

    #[tokio::test]
    async fn test_synchronous_registration_failure() {
        let broker = ScriptedBroker::new();
        broker.reject_with(BrokerError::InvalidKey);
        assert_matches!(
            Peer::new(test_config(), &broker),
            Err(PeerError::Broker(BrokerError::InvalidKey))
        );
    }

    #[tokio::test]
    async fn test_id_resolves_all_waiters() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        assert!(peer.try_id().is_none());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let peer = peer.clone();
                tokio::spawn(async move { peer.id().await })
            })
            .collect();
        tokio::task::yield_now().await;

        broker.assign_id("alice");
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), peer_id("alice"));
        }
        assert_eq!(peer.id().await.unwrap(), peer_id("alice"));
    }

    #[tokio::test]
    async fn test_second_assignment_is_ignored() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        broker.assign_id("first");
        broker.assign_id("second");
        assert_eq!(peer.id().await.unwrap(), peer_id("first"));
    }

    #[tokio::test]
    async fn test_fatal_error_fails_id() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        broker.report_error(BrokerError::IdTaken(peer_id("alice")));
        assert_matches!(
            peer.id().await,
            Err(PeerError::Registration(BrokerError::IdTaken(_)))
        );
    }

    #[tokio::test]
    async fn test_connect_returns_connecting_session() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        let session = peer.connect(&peer_id("bob")).unwrap();

        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.direction(), Direction::Outbound);
        assert_eq!(broker.last_outbound().unwrap().remote_peer(), &peer_id("bob"));
    }

    #[tokio::test]
    async fn test_peer_unavailable_fails_connecting_sessions() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        let ghost = peer.connect(&peer_id("ghost")).unwrap();
        let bob = peer.connect(&peer_id("bob")).unwrap();

        broker.report_error(BrokerError::PeerUnavailable(peer_id("ghost")));

        assert_matches!(
            ghost.write(b"hello").await,
            Err(SessionError::PeerUnavailable { .. })
        );
        assert_eq!(bob.state(), SessionState::Connecting);
        assert!(peer.try_id().is_none());
    }

    #[tokio::test]
    async fn test_inbound_connection_reaches_listener() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        let listener = peer.listen().unwrap();

        broker.deliver_connection(ScriptedChannel::new("carol"));
        let session = listener.accept().await.unwrap();
        assert_eq!(session.remote_peer(), &peer_id("carol"));
        assert_eq!(session.direction(), Direction::Inbound);
    }

    #[tokio::test]
    async fn test_inbound_connection_without_listener_is_closed() {
        let broker = ScriptedBroker::new();
        let _peer = Peer::new(test_config(), &broker).unwrap();
        let channel = ScriptedChannel::new("carol");

        broker.deliver_connection(channel.clone());
        assert_eq!(channel.close_requests(), 1);
        assert!(!channel.is_bound());
    }

    #[tokio::test]
    async fn test_dropped_listener_closes_queued_and_later_connections() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        let listener = peer.listen().unwrap();

        let queued = ScriptedChannel::new("carol");
        queued.open();
        broker.deliver_connection(queued.clone());
        assert!(queued.is_bound());

        drop(listener);
        assert_eq!(queued.close_requests(), 1);

        let late = ScriptedChannel::new("dave");
        broker.deliver_connection(late.clone());
        assert_eq!(late.close_requests(), 1);
        assert!(!late.is_bound());
        assert!(peer.inner.listener.lock().is_none());
    }

    #[tokio::test]
    async fn test_single_open_listener() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();

        let listener = peer.listen().unwrap();
        assert_matches!(peer.listen(), Err(PeerError::AlreadyListening));
        listener.close();
        assert!(peer.listen().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_ends_registration() {
        let broker = ScriptedBroker::new();
        let peer = Peer::new(test_config(), &broker).unwrap();
        let listener = peer.listen().unwrap();

        peer.disconnect();
        assert!(broker.is_disconnected());
        assert!(listener.is_closed());
        assert_matches!(
            peer.id().await,
            Err(PeerError::Registration(BrokerError::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_drop_disconnects() {
        let broker = ScriptedBroker::new();
        drop(Peer::new(test_config(), &broker).unwrap());
        assert!(broker.is_disconnected());
    }
}
