//! Scripted data channel
//!
//! A `ScriptedChannel` never talks to a network. The test decides when the
//! channel opens, which messages arrive and how it ends; everything the
//! session sends is recorded for inspection.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tether_core::{ChannelError, ChannelEvent, ChannelEvents, DataChannel, PeerId};

use crate::fixtures::peer_id;

#[derive(Default)]
struct Script {
    events: Option<Arc<dyn ChannelEvents>>,
    backlog: Vec<ChannelEvent>,
    sent: Vec<Bytes>,
    close_requests: usize,
    send_error: Option<ChannelError>,
}

/// Data channel driven by the test
pub struct ScriptedChannel {
    remote: PeerId,
    script: Mutex<Script>,
}

impl ScriptedChannel {
    /// Channel to the peer named `remote`
    pub fn new(remote: &str) -> Arc<Self> {
        Self::with_peer(peer_id(remote))
    }

    /// Channel to `remote`
    pub fn with_peer(remote: PeerId) -> Arc<Self> {
        Arc::new(Self {
            remote,
            script: Mutex::new(Script::default()),
        })
    }

    /// Raise a notification now, or hold it until a handler is bound
    pub fn emit(&self, event: ChannelEvent) {
        let handler = {
            let mut script = self.script.lock();
            match script.events.clone() {
                Some(events) => events,
                None => {
                    script.backlog.push(event);
                    return;
                }
            }
        };
        event.deliver(handler.as_ref());
    }

    /// Report the channel as open
    pub fn open(&self) {
        self.emit(ChannelEvent::Open);
    }

    /// Deliver one inbound message
    pub fn push(&self, payload: impl Into<Bytes>) {
        self.emit(ChannelEvent::Data(payload.into()));
    }

    /// Report a close initiated by the remote side
    pub fn remote_close(&self) {
        self.emit(ChannelEvent::Close);
    }

    /// Report a library failure
    pub fn fail(&self, error: ChannelError) {
        self.emit(ChannelEvent::Error(error));
    }

    /// Make every following `send` fail with `error`
    pub fn fail_sends_with(&self, error: ChannelError) {
        self.script.lock().send_error = Some(error);
    }

    /// Messages sent so far, in order
    pub fn sent(&self) -> Vec<Bytes> {
        self.script.lock().sent.clone()
    }

    /// Number of `close` calls received
    pub fn close_requests(&self) -> usize {
        self.script.lock().close_requests
    }

    /// Whether a handler was bound
    pub fn is_bound(&self) -> bool {
        self.script.lock().events.is_some()
    }
}

impl DataChannel for ScriptedChannel {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn bind(&self, events: Arc<dyn ChannelEvents>) {
        let backlog = {
            let mut script = self.script.lock();
            script.events = Some(Arc::clone(&events));
            std::mem::take(&mut script.backlog)
        };
        for event in backlog {
            event.deliver(events.as_ref());
        }
    }

    fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        let mut script = self.script.lock();
        if let Some(error) = &script.send_error {
            return Err(error.clone());
        }
        script.sent.push(payload);
        Ok(())
    }

    fn close(&self) {
        self.script.lock().close_requests += 1;
    }
}
