//! Byte-stream adapters for RPC layers
//!
//! Both adapters are thin pass-throughs: no buffering beyond the session's own
//! receive queue, no framing. An orderly close reads as end of stream; every
//! other terminal condition surfaces as an `io::Error`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::SessionError;
use crate::session::Session;

fn read_result(result: Result<usize, SessionError>) -> io::Result<usize> {
    match result {
        Ok(n) => Ok(n),
        Err(SessionError::Closed { .. }) => Ok(0),
        Err(err) => Err(err.into()),
    }
}

/// `AsyncRead + AsyncWrite` view of a session
///
/// Every `poll_write` becomes one channel message, so framed writers should
/// emit a whole frame per write.
#[derive(Debug)]
pub struct SessionStream {
    session: Session,
}

impl SessionStream {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }

    /// Underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Give back the underlying session
    pub fn into_inner(self) -> Session {
        self.session
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        match self.session.poll_read(cx, unfilled) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                let n = read_result(result)?;
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.session
            .poll_write(cx, buf)
            .map(|result| result.map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.session.close() {
            Ok(()) | Err(SessionError::Closed { .. }) => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }
}

/// `std::io::Read + Write` view of a session for plain threads
///
/// Must not be used from inside an async runtime worker.
#[derive(Debug)]
pub struct BlockingStream {
    session: Session,
}

impl BlockingStream {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }

    /// Underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Give back the underlying session
    pub fn into_inner(self) -> Session {
        self.session
    }
}

impl io::Read for BlockingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_result(self.session.read_blocking(buf))
    }
}

impl io::Write for BlockingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session.write_blocking(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
