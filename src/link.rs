//! Non-blocking stream transport seam.
//!
//! The engine never owns sockets directly; it drives a [`StreamLink`] with
//! `try_read`/`try_write` and treats `WouldBlock` as "wait for the poller".
//! Connect completion is folded into the same contract: a link handed out by
//! a [`StreamConnector`] may still be connecting, in which case every
//! operation reports `WouldBlock` until the connection either completes or
//! fails.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// One non-blocking byte stream.
pub trait StreamLink {
    /// Write some bytes; `Err(WouldBlock)` when the socket is not ready.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read some bytes; `Ok(0)` signals end of stream.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens stream connections without blocking the engine.
pub trait StreamConnector {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn StreamLink>>;
}

// =============================================================================
// TOKIO-BACKED CONNECTOR
// =============================================================================

/// Production connector: the connect itself runs on a tokio runtime and the
/// resulting stream is driven with tokio's non-blocking `try_read`/`try_write`.
pub struct TokioConnector {
    handle: Handle,
}

impl TokioConnector {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl StreamConnector for TokioConnector {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<Box<dyn StreamLink>> {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(TcpStream::connect(SocketAddr::V4(addr)).await);
        });
        Ok(Box::new(TokioLink { pending: Some(rx), stream: None }))
    }
}

struct TokioLink {
    pending: Option<oneshot::Receiver<io::Result<TcpStream>>>,
    stream: Option<TcpStream>,
}

impl TokioLink {
    /// Resolve the in-flight connect if it has finished.
    /// Returns `Ok(false)` while still connecting.
    fn poll_connected(&mut self) -> io::Result<bool> {
        if self.stream.is_some() {
            return Ok(true);
        }
        let Some(rx) = self.pending.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        match rx.try_recv() {
            Ok(Ok(stream)) => {
                self.pending = None;
                self.stream = Some(stream);
                Ok(true)
            }
            Ok(Err(e)) => {
                self.pending = None;
                Err(e)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Closed) => {
                self.pending = None;
                Err(io::ErrorKind::ConnectionAborted.into())
            }
        }
    }
}

impl StreamLink for TokioLink {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.poll_connected()? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        match &self.stream {
            Some(stream) => stream.try_write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.poll_connected()? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        match &self.stream {
            Some(stream) => stream.try_read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}
