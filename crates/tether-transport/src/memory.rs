//! In-process signaling broker and data channels
//!
//! `MemoryBroker` behaves like a remote rendezvous service without leaving
//! the process: it assigns identities, relays connection requests and carries
//! messages between endpoint pairs. Every notification, for every peer and
//! every channel, is dispatched from one event-loop task in FIFO order, so
//! handlers observe the same single-threaded delivery a real channel library
//! provides.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tether_core::{
    BrokerError, BrokerEvents, ChannelError, ChannelEvent, ChannelEvents, DataChannel, PeerConfig,
    PeerId, Registration, SignalingBroker, TetherError,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
struct EventLoop {
    jobs: mpsc::UnboundedSender<Job>,
}

impl EventLoop {
    fn spawn(runtime: &Handle) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = queue.recv().await {
                job();
            }
            debug!("Memory broker event loop stopped");
        });
        Self { jobs }
    }

    fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.jobs.send(Box::new(job)).is_err() {
            trace!("Memory broker event loop gone, dropping notification");
        }
    }
}

/// Options for a `MemoryBroker`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBrokerOptions {
    /// Credential every registering peer must present
    pub required_key: Option<String>,

    /// Report connections to unknown identities as `PeerUnavailable`;
    /// when disabled such sessions only fail at their connect deadline
    pub report_unavailable: bool,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            required_key: None,
            report_unavailable: true,
        }
    }
}

impl MemoryBrokerOptions {
    /// Require peers to register with `key`
    pub fn with_required_key(mut self, key: impl Into<String>) -> Self {
        self.required_key = Some(key.into());
        self
    }

    /// Enable or disable `PeerUnavailable` reports
    pub fn with_report_unavailable(mut self, report: bool) -> Self {
        self.report_unavailable = report;
        self
    }
}

struct BrokerState {
    events: EventLoop,
    options: MemoryBrokerOptions,
    peers: Mutex<HashMap<PeerId, Arc<dyn BrokerEvents>>>,
}

impl BrokerState {
    fn lookup(&self, id: &PeerId) -> Option<Arc<dyn BrokerEvents>> {
        self.peers.lock().get(id).cloned()
    }
}

/// Signaling broker living inside the current process
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Start a broker with default options on the current tokio runtime
    pub fn start() -> Result<Self, TetherError> {
        Self::start_with(MemoryBrokerOptions::default())
    }

    /// Start a broker on the current tokio runtime
    pub fn start_with(options: MemoryBrokerOptions) -> Result<Self, TetherError> {
        let runtime = Handle::try_current()
            .map_err(|e| TetherError::internal(format!("memory broker needs a runtime: {e}")))?;
        Ok(Self::spawn(options, &runtime))
    }

    /// Start a broker whose event loop runs on `runtime`
    pub fn spawn(options: MemoryBrokerOptions, runtime: &Handle) -> Self {
        Self {
            state: Arc::new(BrokerState {
                events: EventLoop::spawn(runtime),
                options,
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Whether `id` is currently registered
    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.state.peers.lock().contains_key(id)
    }

    /// Number of registered peers
    pub fn peer_count(&self) -> usize {
        self.state.peers.lock().len()
    }
}

impl SignalingBroker for MemoryBroker {
    fn register(
        &self,
        config: &PeerConfig,
        events: Arc<dyn BrokerEvents>,
    ) -> Result<Arc<dyn Registration>, BrokerError> {
        if let Some(required) = &self.state.options.required_key {
            if config.key.as_deref() != Some(required.as_str()) {
                return Err(BrokerError::InvalidKey);
            }
        }

        let id = config.id.clone().unwrap_or_else(PeerId::generate);
        {
            let mut peers = self.state.peers.lock();
            if peers.contains_key(&id) {
                return Err(BrokerError::IdTaken(id));
            }
            peers.insert(id.clone(), Arc::clone(&events));
        }

        debug!(peer = %id, debug = ?config.debug, "Peer registered with memory broker");
        let assigned = id.clone();
        self.state.events.dispatch(move || events.on_open(assigned));

        Ok(Arc::new(MemoryRegistration {
            id,
            state: Arc::clone(&self.state),
            active: AtomicBool::new(true),
        }))
    }
}

struct MemoryRegistration {
    id: PeerId,
    state: Arc<BrokerState>,
    active: AtomicBool,
}

impl Registration for MemoryRegistration {
    fn connect(&self, remote: &PeerId) -> Result<Arc<dyn DataChannel>, BrokerError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(BrokerError::Disconnected);
        }

        let local = MemoryEndpoint::new(remote.clone(), self.state.events.clone());
        let far = MemoryEndpoint::new(self.id.clone(), self.state.events.clone());
        local.link(&far);

        let state = Arc::clone(&self.state);
        let caller = self.id.clone();
        let target = remote.clone();
        let opener = Arc::clone(&local);
        self.state.events.dispatch(move || match state.lookup(&target) {
            Some(events) => {
                trace!(from = %caller, to = %target, "Relaying connection request");
                events.on_connection(Arc::clone(&far) as Arc<dyn DataChannel>);
                opener.notify(ChannelEvent::Open);
                far.notify(ChannelEvent::Open);
            }
            None => {
                debug!(from = %caller, to = %target, "Connection requested to unknown peer");
                if state.options.report_unavailable {
                    if let Some(events) = state.lookup(&caller) {
                        events.on_error(BrokerError::PeerUnavailable(target));
                    }
                }
            }
        });

        Ok(local)
    }

    fn disconnect(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.state.peers.lock().remove(&self.id);
            debug!(peer = %self.id, "Peer left memory broker");
        }
    }
}

#[derive(Default)]
struct EndpointSlot {
    events: Option<Arc<dyn ChannelEvents>>,
    backlog: VecDeque<ChannelEvent>,
    open: bool,
    closed: bool,
    closing: bool,
}

/// One end of an in-process channel pair
struct MemoryEndpoint {
    remote: PeerId,
    events: EventLoop,
    me: Weak<MemoryEndpoint>,
    far: OnceLock<Weak<MemoryEndpoint>>,
    slot: Mutex<EndpointSlot>,
}

impl MemoryEndpoint {
    fn new(remote: PeerId, events: EventLoop) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            remote,
            events,
            me: me.clone(),
            far: OnceLock::new(),
            slot: Mutex::new(EndpointSlot::default()),
        })
    }

    fn link(self: &Arc<Self>, far: &Arc<Self>) {
        let _ = self.far.set(Arc::downgrade(far));
        let _ = far.far.set(Arc::downgrade(self));
    }

    fn far(&self) -> Option<Arc<Self>> {
        self.far.get().and_then(Weak::upgrade)
    }

    /// Deliver one notification; only called on the event loop
    fn notify(&self, event: ChannelEvent) {
        let handler = {
            let mut slot = self.slot.lock();
            if slot.closed {
                return;
            }
            match &event {
                ChannelEvent::Open => slot.open = true,
                ChannelEvent::Close | ChannelEvent::Error(_) => {
                    slot.open = false;
                    slot.closed = true;
                }
                ChannelEvent::Data(_) => {}
            }
            match slot.events.clone() {
                Some(events) if slot.backlog.is_empty() => events,
                _ => {
                    slot.backlog.push_back(event);
                    return;
                }
            }
        };
        event.deliver(handler.as_ref());
    }

    /// Drain notifications queued before a handler was bound
    fn flush(&self) {
        loop {
            let (events, event) = {
                let mut slot = self.slot.lock();
                let Some(events) = slot.events.clone() else {
                    break;
                };
                let Some(event) = slot.backlog.pop_front() else {
                    break;
                };
                (events, event)
            };
            event.deliver(events.as_ref());
        }
    }
}

impl DataChannel for MemoryEndpoint {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn bind(&self, events: Arc<dyn ChannelEvents>) {
        let pending = {
            let mut slot = self.slot.lock();
            slot.events = Some(events);
            !slot.backlog.is_empty()
        };
        if pending {
            let me = self.me.clone();
            self.events.dispatch(move || {
                if let Some(me) = me.upgrade() {
                    me.flush();
                }
            });
        }
    }

    fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        {
            let slot = self.slot.lock();
            if !slot.open || slot.closing {
                return Err(ChannelError::NotOpen);
            }
        }
        let far = self.far.get().cloned();
        self.events.dispatch(move || {
            if let Some(far) = far.as_ref().and_then(Weak::upgrade) {
                far.notify(ChannelEvent::Data(payload));
            }
        });
        Ok(())
    }

    fn close(&self) {
        {
            let mut slot = self.slot.lock();
            if slot.closing {
                return;
            }
            slot.closing = true;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.events.dispatch(move || {
            me.notify(ChannelEvent::Close);
            if let Some(far) = me.far() {
                far.notify(ChannelEvent::Close);
            }
        });
    }
}
