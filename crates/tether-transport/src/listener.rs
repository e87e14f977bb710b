//! Inbound session queue
//!
//! Sessions offered by the broker (or a socket acceptor) are queued in arrival
//! order and handed out one per `accept`. Closing the listener stops new
//! sessions from being queued; sessions already queued are still handed out.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::ListenerError;
use crate::session::Session;

struct QueueState {
    sessions: VecDeque<Session>,
    closed: bool,
}

/// FIFO of inbound sessions shared between a producer and a `Listener`
pub(crate) struct AcceptQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl AcceptQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                sessions: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Queue a session; hands it back if the queue is closed
    pub(crate) fn push(&self, session: Session) -> Result<(), Session> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(session);
            }
            state.sessions.push_back(session);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Returns `true` only for the call that closed the queue
    pub(crate) fn close(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Close the queue and take every session nobody accepted
    pub(crate) fn drain_closed(&self) -> Vec<Session> {
        let stranded: Vec<Session> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.sessions.drain(..).collect()
        };
        self.notify.notify_waiters();
        stranded
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub(crate) async fn pop(&self) -> Result<Session, ListenerError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(session) = state.sessions.pop_front() {
                    return Ok(session);
                }
                if state.closed {
                    return Err(ListenerError::Closed);
                }
            }
            notified.await;
        }
    }
}

/// Accepts inbound sessions for one peer or socket
///
/// Dropping the listener closes it along with every session still queued.
pub struct Listener {
    queue: Arc<AcceptQueue>,
}

impl Listener {
    pub(crate) fn new(queue: Arc<AcceptQueue>) -> Self {
        Self { queue }
    }

    /// Wait for the next inbound session
    ///
    /// Sessions are returned in arrival order. Once the listener is closed and
    /// the queue is drained, returns `ListenerError::Closed`.
    pub async fn accept(&self) -> Result<Session, ListenerError> {
        let session = self.queue.pop().await?;
        info!(
            session = %session.id(),
            remote = %session.remote_peer(),
            "Accepted connection from remote peer"
        );
        Ok(session)
    }

    /// Blocking `accept` for callers on plain threads
    pub fn accept_blocking(&self) -> Result<Session, ListenerError> {
        futures::executor::block_on(self.accept())
    }

    /// Stop accepting new sessions and wake pending `accept` calls
    pub fn close(&self) {
        if self.queue.close() {
            debug!(pending = self.queue.len(), "Listener closed");
        }
    }

    /// Whether the listener was closed
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Sessions queued and not yet accepted
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let stranded = self.queue.drain_closed();
        if !stranded.is_empty() {
            debug!(count = stranded.len(), "Closing sessions left in dropped listener");
        }
        for session in stranded {
            let _ = session.close();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Direction, SessionState};
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tether_testkit::{peer_id, ScriptedChannel};
    use tokio::runtime::Handle;

    fn inbound(remote: &str) -> Session {
        Session::establish(
            ScriptedChannel::new(remote),
            Direction::Inbound,
            Duration::from_secs(5),
            &Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_accept_returns_sessions_in_arrival_order() {
        let queue = AcceptQueue::new();
        let listener = Listener::new(queue.clone());

        for name in ["a", "b", "c"] {
            assert!(queue.push(inbound(name)).is_ok());
        }
        assert_eq!(listener.pending(), 3);

        for name in ["a", "b", "c"] {
            let session = listener.accept().await.unwrap();
            assert_eq!(session.remote_peer(), &peer_id(name));
        }
    }

    #[tokio::test]
    async fn test_accept_waits_for_arrival() {
        let queue = AcceptQueue::new();
        let listener = Arc::new(Listener::new(queue.clone()));

        let acceptor = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;
        assert!(!acceptor.is_finished());

        queue.push(inbound("late")).unwrap();
        let session = acceptor.await.unwrap().unwrap();
        assert_eq!(session.remote_peer(), &peer_id("late"));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let queue = AcceptQueue::new();
        let listener = Arc::new(Listener::new(queue));

        let acceptor = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;
        listener.close();

        assert_matches!(acceptor.await.unwrap(), Err(ListenerError::Closed));
    }

    #[tokio::test]
    async fn test_queued_sessions_survive_close() {
        let queue = AcceptQueue::new();
        let listener = Listener::new(queue.clone());
        queue.push(inbound("queued")).unwrap();
        listener.close();

        assert!(queue.push(inbound("rejected")).is_err());
        assert!(listener.accept().await.is_ok());
        assert_matches!(listener.accept().await, Err(ListenerError::Closed));
    }

    #[tokio::test]
    async fn test_drop_closes_queue() {
        let queue = AcceptQueue::new();
        drop(Listener::new(queue.clone()));
        assert!(queue.is_closed());
        assert!(!queue.close());
    }

    #[tokio::test]
    async fn test_drop_closes_unaccepted_sessions() {
        let queue = AcceptQueue::new();
        let listener = Listener::new(queue.clone());
        let channel = ScriptedChannel::new("stranded");
        let session = Session::establish(
            channel.clone(),
            Direction::Inbound,
            Duration::from_secs(5),
            &Handle::current(),
        );
        channel.open();
        queue.push(session.clone()).unwrap();

        drop(listener);
        assert_eq!(queue.len(), 0);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(channel.close_requests(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acceptors_each_get_one_session() {
        let queue = AcceptQueue::new();
        let listener = Arc::new(Listener::new(queue.clone()));

        let acceptors: Vec<_> = (0..3)
            .map(|_| {
                let listener = listener.clone();
                tokio::spawn(async move { listener.accept().await })
            })
            .collect();
        tokio::task::yield_now().await;

        for name in ["a", "b", "c"] {
            queue.push(inbound(name)).unwrap();
        }

        let mut remotes = Vec::new();
        for acceptor in acceptors {
            let session = acceptor.await.unwrap().unwrap();
            remotes.push(session.remote_peer().as_str().to_string());
        }
        remotes.sort();
        assert_eq!(remotes, vec!["a", "b", "c"]);
        assert_eq!(listener.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_every_blocked_acceptor() {
        let queue = AcceptQueue::new();
        let listener = Arc::new(Listener::new(queue));

        let acceptors: Vec<_> = (0..3)
            .map(|_| {
                let listener = listener.clone();
                tokio::spawn(async move { listener.accept().await })
            })
            .collect();
        tokio::task::yield_now().await;
        listener.close();

        for acceptor in acceptors {
            assert_matches!(acceptor.await.unwrap(), Err(ListenerError::Closed));
        }
    }
}
