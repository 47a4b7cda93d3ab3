//! Listener trait and implementations for accepting NBD connections.
//!
//! Provides a unified abstraction over different connection sources:
//! - TCP sockets (production)
//! - Unix sockets
//! - Channel-based streams (testing/benchmarks via `StreamListener`)
//!
//! Every accepted stream comes with a peer label used to tag the session's
//! log events.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::warn;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Trait for accepting incoming connections.
///
/// Implemented for `TcpListener`, `UnixListener`, and `StreamListener`.
/// An `ErrorKind::BrokenPipe` error means the listener is exhausted.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next incoming connection and describe its peer.
    async fn accept(&mut self) -> std::io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, String)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        Ok((stream, addr.to_string()))
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, String)> {
        let (stream, addr) = UnixListener::accept(self).await?;
        let peer = match addr.as_pathname() {
            Some(path) => path.display().to_string(),
            None => "unix:unnamed".to_string(),
        };
        Ok((stream, peer))
    }
}

/// A listener that accepts streams from a channel.
///
/// Useful for testing and benchmarks where connections are established
/// via in-memory duplex streams rather than real sockets.
///
/// # Example
///
/// ```ignore
/// use tokio::io::duplex;
/// use netbd::nbd::StreamListener;
///
/// let (tx, listener) = StreamListener::new(4);
///
/// // Spawn server accepting from listener
/// tokio::spawn(daemon.listen(listener));
///
/// let (client_stream, server_stream) = duplex(1024 * 1024);
/// tx.send(server_stream).await.unwrap();
/// let client = NbdClient::connect(client_stream, "disk0").await.unwrap();
/// ```
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
    accepted: AtomicU64,
}

impl<S> StreamListener<S> {
    /// Create a new stream listener with the given buffer capacity.
    ///
    /// Returns the sender half for pushing streams and the listener.
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            tx,
            Self {
                rx,
                accepted: AtomicU64::new(0),
            },
        )
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, String)> {
        let stream = self.rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed")
        })?;
        let n = self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok((stream, format!("stream-{n}")))
    }
}
