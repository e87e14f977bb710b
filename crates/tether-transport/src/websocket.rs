//! WebSocket transport
//!
//! Carries sessions over plain WebSocket connections instead of a brokered
//! peer-to-peer channel. Each connection gets one pump task that plays the
//! role of the channel library's event loop: frames from the socket become
//! channel notifications, and sends and closes requested by the session are
//! forwarded to the socket.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ChannelError, ChannelEvents, DataChannel, PeerId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::listener::{AcceptQueue, Listener};
use crate::session::{Direction, Session};

/// Default bound on the WebSocket handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Bound on the opening handshake and on the session reaching `Open`
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// WebSocket transport errors
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    /// Socket level failure
    #[error("websocket io error: {0}")]
    Io(#[from] io::Error),

    /// The opening handshake failed
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// The handshake did not finish in time
    #[error("websocket handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The remote violated the WebSocket protocol
    #[error("websocket protocol error: {0}")]
    Protocol(String),
}

impl From<tungstenite::Error> for WebSocketError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(e) => Self::Io(e),
            tungstenite::Error::Protocol(e) => Self::Protocol(e.to_string()),
            other => Self::Handshake(other.to_string()),
        }
    }
}

fn channel_error(err: tungstenite::Error) -> ChannelError {
    match err {
        tungstenite::Error::Io(e) => ChannelError::connection_lost(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ChannelError::connection_lost("websocket closed")
        }
        other => ChannelError::other("websocket", other.to_string()),
    }
}

enum Command {
    Send(Bytes),
    Close,
}

/// Data channel backed by one WebSocket connection
struct WebSocketChannel {
    remote: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    bound: Mutex<Option<oneshot::Sender<Arc<dyn ChannelEvents>>>>,
}

impl WebSocketChannel {
    /// Wrap `socket` and spawn its pump task
    fn spawn<S>(socket: WebSocketStream<S>, remote: PeerId, runtime: &Handle) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, queue) = mpsc::unbounded_channel();
        let (bound, handler) = oneshot::channel();
        runtime.spawn(pump(socket, remote.clone(), handler, queue));
        Arc::new(Self {
            remote,
            commands,
            bound: Mutex::new(Some(bound)),
        })
    }
}

impl DataChannel for WebSocketChannel {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn bind(&self, events: Arc<dyn ChannelEvents>) {
        if let Some(bound) = self.bound.lock().take() {
            let _ = bound.send(events);
        }
    }

    fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        self.commands
            .send(Command::Send(payload))
            .map_err(|_| ChannelError::NotOpen)
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Per-connection event loop
async fn pump<S>(
    mut socket: WebSocketStream<S>,
    remote: PeerId,
    handler: oneshot::Receiver<Arc<dyn ChannelEvents>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(events) = handler.await else {
        debug!(remote = %remote, "WebSocket channel dropped before bind");
        let _ = socket.close(None).await;
        return;
    };
    events.on_open();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(payload)) => {
                    if let Err(e) = socket.send(Message::Binary(payload.to_vec())).await {
                        events.on_error(channel_error(e));
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = socket.close(None).await;
                    events.on_close();
                    break;
                }
            },
            frame = socket.next() => match frame {
                Some(Ok(Message::Binary(data))) => events.on_data(Bytes::from(data)),
                Some(Ok(Message::Text(text))) => events.on_data(Bytes::from(text.into_bytes())),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    events.on_close();
                    break;
                }
                Some(Err(e)) => {
                    events.on_error(channel_error(e));
                    break;
                }
            },
        }
    }
    debug!(remote = %remote, "WebSocket pump stopped");
}

fn current_runtime() -> Result<Handle, WebSocketError> {
    Handle::try_current().map_err(|e| WebSocketError::Io(io::Error::other(e)))
}

fn peer_for(address: &str) -> Result<PeerId, WebSocketError> {
    PeerId::new(address).map_err(|e| WebSocketError::Handshake(e.to_string()))
}

/// Open a session to the WebSocket server at `url`
///
/// Returns once the session is open.
pub async fn dial(url: &str, config: &WebSocketConfig) -> Result<Session, WebSocketError> {
    let runtime = current_runtime()?;
    let (socket, _response) = timeout(config.handshake_timeout, connect_async(url))
        .await
        .map_err(|_| WebSocketError::Timeout(config.handshake_timeout))??;

    let channel = WebSocketChannel::spawn(socket, peer_for(url)?, &runtime);
    let session = Session::establish(
        channel,
        Direction::Outbound,
        config.handshake_timeout,
        &runtime,
    );
    session
        .ready()
        .await
        .map_err(|e| WebSocketError::Handshake(e.to_string()))?;
    info!(session = %session.id(), remote = %url, "WebSocket session open");
    Ok(session)
}

/// Accepts WebSocket connections and hands them out as sessions
pub struct WebSocketListener {
    local_addr: SocketAddr,
    listener: Listener,
    task: JoinHandle<()>,
}

impl WebSocketListener {
    /// Bind a TCP listener and start accepting WebSocket connections
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: WebSocketConfig,
    ) -> Result<Self, WebSocketError> {
        let runtime = current_runtime()?;
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        let queue = AcceptQueue::new();

        let task = runtime.spawn(accept_loop(tcp, Arc::clone(&queue), config));
        info!(addr = %local_addr, "WebSocket listener bound");
        Ok(Self {
            local_addr,
            listener: Listener::new(queue),
            task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next open session
    pub async fn accept(&self) -> Result<Session, ListenerError> {
        self.listener.accept().await
    }

    /// Stop accepting connections
    pub fn close(&self) {
        self.listener.close();
        self.task.abort();
    }
}

impl Drop for WebSocketListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.local_addr)
            .field("listener", &self.listener)
            .finish()
    }
}

/// Pause after a failed socket accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Wait out a failed accept; `false` once the listener is closed
async fn accept_backoff(queue: &AcceptQueue) -> bool {
    if queue.is_closed() {
        return false;
    }
    tokio::time::sleep(ACCEPT_BACKOFF).await;
    !queue.is_closed()
}

async fn accept_loop(tcp: TcpListener, queue: Arc<AcceptQueue>, config: WebSocketConfig) {
    loop {
        let (stream, remote) = match tcp.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "WebSocket accept failed");
                if accept_backoff(&queue).await {
                    continue;
                }
                break;
            }
        };
        if queue.is_closed() {
            break;
        }
        tokio::spawn(handshake(stream, remote, Arc::clone(&queue), config.clone()));
    }
}

async fn handshake(
    stream: TcpStream,
    remote: SocketAddr,
    queue: Arc<AcceptQueue>,
    config: WebSocketConfig,
) {
    let socket = match timeout(config.handshake_timeout, accept_async(stream)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            warn!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(remote = %remote, "WebSocket handshake timed out");
            return;
        }
    };

    let runtime = Handle::current();
    let peer = match peer_for(&remote.to_string()) {
        Ok(peer) => peer,
        Err(e) => {
            warn!(remote = %remote, error = %e, "Rejecting WebSocket connection");
            return;
        }
    };
    let channel = WebSocketChannel::spawn(socket, peer, &runtime);
    let session = Session::establish(
        channel,
        Direction::Inbound,
        config.handshake_timeout,
        &runtime,
    );
    if let Err(e) = session.ready().await {
        warn!(remote = %remote, error = %e, "WebSocket session failed to open");
        return;
    }
    if let Err(session) = queue.push(session) {
        debug!(remote = %remote, "Listener closed, dropping WebSocket session");
        let _ = session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err: WebSocketError = tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, WebSocketError::Handshake(_)));

        assert!(matches!(
            channel_error(tungstenite::Error::AlreadyClosed),
            ChannelError::ConnectionLost { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff_pauses_until_closed() {
        let queue = AcceptQueue::new();

        let started = tokio::time::Instant::now();
        assert!(accept_backoff(&queue).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        queue.close();
        let started = tokio::time::Instant::now();
        assert!(!accept_backoff(&queue).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(&format!("ws://{addr}"), &WebSocketConfig::default()).await;
        assert!(matches!(result, Err(WebSocketError::Io(_))));
    }
}
