//! Sessions: one data channel presented as a suspending byte stream
//!
//! A `Session` owns one `DataChannel` and translates its notifications into a
//! small state machine:
//!
//! ```text
//! Connecting ──open──▶ Open ──close──▶ Closed
//!     │                  │
//!     ├──close─────────▶ Closed
//!     └──deadline/error─▶ Errored ◀──error── Open
//! ```
//!
//! Notifications arrive on the channel library's event loop and only mutate
//! state and wake registered tasks. Readers and writers run elsewhere and
//! suspend until the state they need is reached. Every terminal condition is
//! recorded exactly once and replayed to all callers afterwards.
//!
//! Each `write` becomes exactly one channel message; no coalescing or
//! fragmentation happens here. Callers must write whole protocol frames per
//! call.

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tether_core::{ChannelError, ChannelEvents, DataChannel, PeerId, SessionId};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::SessionError;
use crate::stream::{BlockingStream, SessionStream};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the channel to open
    Connecting,
    /// Carrying messages
    Open,
    /// Closed in an orderly way
    Closed,
    /// Failed
    Errored,
}

impl SessionState {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// Which side initiated the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Created by `Peer::connect` or a dial
    Outbound,
    /// Delivered through a `Listener`
    Inbound,
}

/// Traffic counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
}

#[derive(Default)]
struct WakerList(Vec<Waker>);

impl WakerList {
    fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    fn drain_into(&mut self, out: &mut Vec<Waker>) {
        out.append(&mut self.0);
    }
}

fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

struct Inner {
    state: SessionState,
    pending: VecDeque<Bytes>,
    last_error: Option<SessionError>,
    readers: WakerList,
    writers: WakerList,
    stats: SessionStats,
    deadline: Option<JoinHandle<()>>,
}

impl Inner {
    /// Copy from the head of the receive queue, keeping any remainder
    fn take_buffered(&mut self, buf: &mut [u8]) -> Option<usize> {
        let head = self.pending.front_mut()?;
        let n = head.len().min(buf.len());
        buf[..n].copy_from_slice(&head[..n]);
        head.advance(n);
        if head.is_empty() {
            self.pending.pop_front();
        }
        Some(n)
    }

    /// Enter a terminal state; returns the tasks to wake, or `None` if the
    /// session was already terminal
    fn terminate(&mut self, state: SessionState, error: SessionError) -> Option<Vec<Waker>> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = state;
        self.last_error = Some(error);
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        let mut wakers = Vec::new();
        self.readers.drain_into(&mut wakers);
        self.writers.drain_into(&mut wakers);
        Some(wakers)
    }
}

struct Shared {
    id: SessionId,
    remote: PeerId,
    direction: Direction,
    channel: Arc<dyn DataChannel>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn handle_open(&self) {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Connecting {
                trace!(session = %self.id, state = ?inner.state, "Ignoring open notification");
                return;
            }
            inner.state = SessionState::Open;
            if let Some(deadline) = inner.deadline.take() {
                deadline.abort();
            }
            let mut wakers = Vec::new();
            inner.writers.drain_into(&mut wakers);
            wakers
        };
        info!(session = %self.id, remote = %self.remote, "Connection open");
        wake_all(wakers);
    }

    fn handle_data(&self, payload: Bytes) {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                trace!(session = %self.id, len = payload.len(), "Dropping data after termination");
                return;
            }
            if payload.is_empty() {
                return;
            }
            inner.stats.messages_received += 1;
            inner.stats.bytes_received += payload.len() as u64;
            inner.pending.push_back(payload);
            let mut wakers = Vec::new();
            inner.readers.drain_into(&mut wakers);
            wakers
        };
        wake_all(wakers);
    }

    /// Record a terminal condition; returns whether this call made the
    /// transition
    fn terminate(&self, state: SessionState, error: SessionError) -> bool {
        let wakers = self.inner.lock().terminate(state, error);
        match wakers {
            Some(wakers) => {
                wake_all(wakers);
                true
            }
            None => false,
        }
    }

    /// Fail the session only if it has not opened yet
    fn fail_connecting(&self, error: SessionError) -> bool {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Connecting {
                return false;
            }
            inner.terminate(SessionState::Errored, error)
        };
        match wakers {
            Some(wakers) => {
                wake_all(wakers);
                self.channel.close();
                true
            }
            None => false,
        }
    }

    fn handle_close(&self) {
        let closed = self.terminate(
            SessionState::Closed,
            SessionError::Closed {
                peer: self.remote.clone(),
            },
        );
        if closed {
            info!(session = %self.id, remote = %self.remote, "Connection closed");
        }
    }

    fn handle_error(&self, error: ChannelError) {
        warn!(session = %self.id, remote = %self.remote, error = %error, "Connection error");
        self.terminate(
            SessionState::Errored,
            SessionError::Channel {
                peer: self.remote.clone(),
                source: error,
            },
        );
    }

    fn expire(&self, after: Duration) {
        let expired = self.fail_connecting(SessionError::Timeout {
            peer: self.remote.clone(),
            after,
        });
        if expired {
            warn!(session = %self.id, remote = %self.remote, ?after, "Connection timed out");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(deadline) = inner.deadline.take() {
            deadline.abort();
        }
        if !inner.state.is_terminal() {
            debug!(session = %self.id, remote = %self.remote, "Session dropped while live, closing channel");
            self.channel.close();
        }
    }
}

/// Notification handler bound to the channel
///
/// Holds the session weakly so the channel library never keeps a session
/// alive on its own.
struct SessionEvents {
    shared: Weak<Shared>,
}

impl ChannelEvents for SessionEvents {
    fn on_open(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_open();
        }
    }

    fn on_data(&self, payload: Bytes) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_data(payload);
        }
    }

    fn on_close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_close();
        }
    }

    fn on_error(&self, error: ChannelError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_error(error);
        }
    }
}

/// One peer-to-peer data channel exposed as a byte stream
///
/// Cloning yields another handle to the same session. The channel is closed
/// when the last handle is dropped while the session is still live.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Wrap a freshly created channel, bind its notifications and arm the
    /// connect deadline on `runtime`
    pub fn establish(
        channel: Arc<dyn DataChannel>,
        direction: Direction,
        connect_timeout: Duration,
        runtime: &Handle,
    ) -> Self {
        let shared = Arc::new(Shared {
            id: SessionId::next(),
            remote: channel.remote_peer().clone(),
            direction,
            channel: Arc::clone(&channel),
            inner: Mutex::new(Inner {
                state: SessionState::Connecting,
                pending: VecDeque::new(),
                last_error: None,
                readers: WakerList::default(),
                writers: WakerList::default(),
                stats: SessionStats::default(),
                deadline: None,
            }),
        });

        let weak = Arc::downgrade(&shared);
        let deadline = runtime.spawn(async move {
            tokio::time::sleep(connect_timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(connect_timeout);
            }
        });
        {
            let mut inner = shared.inner.lock();
            if inner.state == SessionState::Connecting {
                inner.deadline = Some(deadline);
            } else {
                deadline.abort();
            }
        }

        channel.bind(Arc::new(SessionEvents {
            shared: Arc::downgrade(&shared),
        }));

        debug!(
            session = %shared.id,
            remote = %shared.remote,
            ?direction,
            ?connect_timeout,
            "Session created"
        );
        Self { shared }
    }

    /// Local identifier used in logs
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Identity of the remote peer
    pub fn remote_peer(&self) -> &PeerId {
        &self.shared.remote
    }

    /// Which side initiated the session
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Terminal condition, once one was recorded
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Traffic counters
    pub fn stats(&self) -> SessionStats {
        self.shared.inner.lock().stats
    }

    /// Bytes received and not yet read
    pub fn buffered(&self) -> usize {
        self.shared
            .inner
            .lock()
            .pending
            .iter()
            .map(Bytes::len)
            .sum()
    }

    /// Poll for readable bytes
    ///
    /// Buffered bytes are always handed out before a terminal condition is
    /// reported.
    pub fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<usize, SessionError>> {
        let mut inner = self.shared.inner.lock();
        if let Some(n) = inner.take_buffered(buf) {
            return Poll::Ready(Ok(n));
        }
        if let Some(error) = &inner.last_error {
            return Poll::Ready(Err(error.clone()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        inner.readers.register(cx.waker());
        Poll::Pending
    }

    /// Poll to send `buf` as one message
    ///
    /// Stays pending while the session is connecting; nothing is sent before
    /// the channel opens.
    pub fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, SessionError>> {
        {
            let mut inner = self.shared.inner.lock();
            if let Some(error) = &inner.last_error {
                return Poll::Ready(Err(error.clone()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            if inner.state == SessionState::Connecting {
                trace!(session = %self.shared.id, "Waiting for channel to connect");
                inner.writers.register(cx.waker());
                return Poll::Pending;
            }
        }

        // The library is never called with the session lock held.
        match self.shared.channel.send(Bytes::copy_from_slice(buf)) {
            Ok(()) => {
                let mut inner = self.shared.inner.lock();
                inner.stats.messages_sent += 1;
                inner.stats.bytes_sent += buf.len() as u64;
                Poll::Ready(Ok(buf.len()))
            }
            Err(error) => {
                self.shared.handle_error(error.clone());
                let recorded = self.shared.inner.lock().last_error.clone();
                Poll::Ready(Err(recorded.unwrap_or(SessionError::Channel {
                    peer: self.shared.remote.clone(),
                    source: error,
                })))
            }
        }
    }

    /// Poll until the session is open or terminal
    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), SessionError>> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            SessionState::Open => Poll::Ready(Ok(())),
            SessionState::Connecting => {
                inner.writers.register(cx.waker());
                Poll::Pending
            }
            SessionState::Closed | SessionState::Errored => Poll::Ready(Err(inner
                .last_error
                .clone()
                .unwrap_or(SessionError::Closed {
                    peer: self.shared.remote.clone(),
                }))),
        }
    }

    /// Read up to `buf.len()` bytes, suspending until data or termination
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    /// Send `buf` as one message, suspending while the session connects
    pub async fn write(&self, buf: &[u8]) -> Result<usize, SessionError> {
        poll_fn(|cx| self.poll_write(cx, buf)).await
    }

    /// Suspend until the session is open
    pub async fn ready(&self) -> Result<(), SessionError> {
        poll_fn(|cx| self.poll_ready(cx)).await
    }

    /// Blocking `read` for callers on plain threads
    ///
    /// Must not be called from inside an async runtime worker.
    pub fn read_blocking(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        futures::executor::block_on(self.read(buf))
    }

    /// Blocking `write` for callers on plain threads
    ///
    /// Must not be called from inside an async runtime worker.
    pub fn write_blocking(&self, buf: &[u8]) -> Result<usize, SessionError> {
        futures::executor::block_on(self.write(buf))
    }

    /// Close the session
    ///
    /// Once the session is terminal, returns the recorded condition: the
    /// failure for an errored session, `SessionError::Closed` for a closed
    /// one. Does not wait for the remote side.
    pub fn close(&self) -> Result<(), SessionError> {
        let wakers = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return Err(inner.last_error.clone().unwrap_or(SessionError::Closed {
                    peer: self.shared.remote.clone(),
                }));
            }
            inner.terminate(
                SessionState::Closed,
                SessionError::Closed {
                    peer: self.shared.remote.clone(),
                },
            )
        };
        if let Some(wakers) = wakers {
            wake_all(wakers);
        }
        self.shared.channel.close();
        info!(session = %self.shared.id, remote = %self.shared.remote, "Connection closed locally");
        Ok(())
    }

    /// Present this session as an async byte stream
    pub fn into_stream(self) -> SessionStream {
        SessionStream::new(self)
    }

    /// Present this session as a blocking byte stream
    pub fn into_blocking(self) -> BlockingStream {
        BlockingStream::new(self)
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.shared))
    }

    /// Fail a still-connecting session because the broker reported the
    /// remote as unknown
    pub(crate) fn fail_unavailable(&self) -> bool {
        let failed = self.shared.fail_connecting(SessionError::PeerUnavailable {
            peer: self.shared.remote.clone(),
        });
        if failed {
            warn!(session = %self.shared.id, remote = %self.shared.remote, "Remote peer unavailable");
        }
        failed
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("remote", &self.shared.remote)
            .field("direction", &self.shared.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning handle used by peers to track outbound sessions
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<Shared>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|shared| Session { shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use tether_testkit::{peer_id, ScriptedChannel};

    fn open_session(channel: &Arc<ScriptedChannel>) -> Session {
        let session = Session::establish(
            channel.clone(),
            Direction::Outbound,
            Duration::from_secs(5),
            &Handle::current(),
        );
        channel.open();
        session
    }

    #[tokio::test]
    async fn test_new_session_is_connecting_and_bound() {
        let channel = ScriptedChannel::new("bob");
        let session = Session::establish(
            channel.clone(),
            Direction::Inbound,
            Duration::from_secs(5),
            &Handle::current(),
        );

        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.direction(), Direction::Inbound);
        assert_eq!(session.remote_peer(), &peer_id("bob"));
        assert!(channel.is_bound());
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_open_then_read_message() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        assert_eq!(session.state(), SessionState::Open);

        channel.push(&b"Hello World"[..]);
        let mut buf = [0u8; 64];
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello World");
    }

    #[tokio::test]
    async fn test_partial_reads_keep_remainder() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        channel.push(&b"abcdef"[..]);
        channel.push(&b"gh"[..]);

        let mut buf = [0u8; 4];
        assert_eq!(session.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(session.buffered(), 4);
        assert_eq!(session.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(session.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"gh");
        assert_eq!(session.buffered(), 0);
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_data() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = session.read(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::task::yield_now().await;
        channel.push(&b"late"[..]);

        assert_eq!(reader.await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_blocked_read_returns_closed_on_remote_close() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                session.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        channel.remote_close();

        assert_matches!(reader.await.unwrap(), Err(SessionError::Closed { .. }));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_buffered_data_delivered_before_terminal_error() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        channel.push(&b"last words"[..]);
        channel.fail(ChannelError::connection_lost("ice disconnected"));

        let mut buf = [0u8; 64];
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"last words");
        assert_matches!(
            session.read(&mut buf).await,
            Err(SessionError::Channel { source: ChannelError::ConnectionLost { .. }, .. })
        );
    }

    #[tokio::test]
    async fn test_terminal_error_is_permanent() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        channel.fail(ChannelError::other("network", "boom"));
        let first = session.last_error().unwrap();

        channel.remote_close();
        channel.open();
        channel.push(&b"ignored"[..]);
        channel.fail(ChannelError::NotOpen);

        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.last_error().unwrap(), first);
        assert_eq!(session.buffered(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(session.read(&mut buf).await.unwrap_err(), first);
        assert_eq!(session.write(b"x").await.unwrap_err(), first);
        assert_eq!(session.close().unwrap_err(), first);
    }

    #[tokio::test]
    async fn test_write_sends_one_message_per_call() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);

        assert_eq!(session.write(b"one").await.unwrap(), 3);
        assert_eq!(session.write(b"two").await.unwrap(), 3);
        assert_eq!(session.write(b"three").await.unwrap(), 5);

        assert_eq!(
            channel.sent(),
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three"),
            ]
        );
        let stats = session.stats();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.bytes_sent, 11);
    }

    #[tokio::test]
    async fn test_write_waits_for_open() {
        let channel = ScriptedChannel::new("bob");
        let session = Session::establish(
            channel.clone(),
            Direction::Outbound,
            Duration::from_secs(5),
            &Handle::current(),
        );

        let writer = {
            let session = session.clone();
            tokio::spawn(async move { session.write(b"early").await })
        };
        tokio::task::yield_now().await;
        assert!(channel.sent().is_empty());
        assert!(!writer.is_finished());

        channel.open();
        assert_eq!(writer.await.unwrap().unwrap(), 5);
        assert_eq!(channel.sent(), vec![Bytes::from_static(b"early")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_while_connecting_times_out_without_sending() {
        let channel = ScriptedChannel::new("ghost");
        let session = Session::establish(
            channel.clone(),
            Direction::Outbound,
            Duration::from_secs(5),
            &Handle::current(),
        );

        let err = session.write(b"Hello World").await.unwrap_err();
        assert_matches!(err, SessionError::Timeout { after, .. } if after == Duration::from_secs(5));
        assert!(channel.sent().is_empty());
        assert_eq!(channel.close_requests(), 1);

        // A late open must not resurrect the session.
        channel.open();
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wakes_every_waiter_once() {
        let channel = ScriptedChannel::new("ghost");
        let session = Session::establish(
            channel.clone(),
            Direction::Outbound,
            Duration::from_secs(5),
            &Handle::current(),
        );

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                session.read(&mut buf).await
            })
        };
        let writer = {
            let session = session.clone();
            tokio::spawn(async move { session.write(b"x").await })
        };

        let read_err = reader.await.unwrap().unwrap_err();
        let write_err = writer.await.unwrap().unwrap_err();
        assert!(read_err.is_timeout());
        assert_eq!(read_err, write_err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_before_deadline_disarms_timeout() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.write(b"still here").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_error_before_open_fails_writer() {
        let channel = ScriptedChannel::new("bob");
        let session = Session::establish(
            channel.clone(),
            Direction::Outbound,
            Duration::from_secs(5),
            &Handle::current(),
        );
        let writer = {
            let session = session.clone();
            tokio::spawn(async move { session.write(b"x").await })
        };
        tokio::task::yield_now().await;
        channel.fail(ChannelError::Negotiation {
            reason: "no route".into(),
        });

        assert_matches!(writer.await.unwrap(), Err(SessionError::Channel { .. }));
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_then_close_again() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);

        assert!(session.close().is_ok());
        assert_matches!(session.close(), Err(SessionError::Closed { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(channel.close_requests(), 1);

        let mut buf = [0u8; 4];
        assert_matches!(session.read(&mut buf).await, Err(SessionError::Closed { .. }));
        assert_matches!(session.write(b"x").await, Err(SessionError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_close_after_remote_close_returns_closed() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        channel.remote_close();

        let err = session.close().unwrap_err();
        assert_matches!(err, SessionError::Closed { ref peer } if *peer == peer_id("bob"));
        assert_eq!(session.last_error(), Some(err));
        assert_eq!(channel.close_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_terminates_session() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        channel.fail_sends_with(ChannelError::NotOpen);

        assert_matches!(
            session.write(b"x").await,
            Err(SessionError::Channel { source: ChannelError::NotOpen, .. })
        );
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_channel() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        let clone = session.clone();
        drop(session);
        assert_eq!(channel.close_requests(), 0);
        drop(clone);
        assert_eq!(channel.close_requests(), 1);
    }

    #[tokio::test]
    async fn test_ready_reports_open_and_failure() {
        let channel = ScriptedChannel::new("bob");
        let session = open_session(&channel);
        assert!(session.ready().await.is_ok());

        let channel = ScriptedChannel::new("carol");
        let session = Session::establish(
            channel.clone(),
            Direction::Outbound,
            Duration::from_secs(5),
            &Handle::current(),
        );
        channel.remote_close();
        assert_matches!(session.ready().await, Err(SessionError::Closed { .. }));
    }

    proptest! {
        #[test]
        fn prop_reads_reassemble_message(
            message in proptest::collection::vec(any::<u8>(), 1..512),
            sizes in proptest::collection::vec(1usize..64, 1..64),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let channel = ScriptedChannel::new("bob");
            let session = Session::establish(
                channel.clone(),
                Direction::Inbound,
                Duration::from_secs(5),
                runtime.handle(),
            );
            channel.open();
            channel.push(message.clone());

            let mut received = Vec::new();
            let mut sizes = sizes.into_iter().cycle();
            while received.len() < message.len() {
                let mut buf = vec![0u8; sizes.next().unwrap_or(1)];
                let n = session.read_blocking(&mut buf).unwrap();
                prop_assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(received, message);
            prop_assert_eq!(session.buffered(), 0);
        }
    }
}
