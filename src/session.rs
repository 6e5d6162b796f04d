//! Per-connection state and its read/write cycles.
//!
//! Each accepted connection is split into two halves. The read cycle owns the
//! read half and a fixed-capacity buffer; it decodes every completed read and
//! hands it to the broadcast engine before issuing the next read, so a single
//! session never has two reads in flight. The write cycle owns the write half
//! and drains the session's outbound queue in order.
//!
//! A session closes exactly once. Whichever path gets there first (quit, EOF,
//! read or write failure, server shutdown) flips the close signal and both
//! cycles wind down.

use crate::broadcast;
use crate::registry::ConnectionRegistry;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{info, trace, warn};

/// Sentinel text that ends a session.
pub const QUIT: &str = "quit";

/// Identity of a connection, unique for the lifetime of the server.
pub type ConnId = u64;

/// Exact, case-sensitive sentinel match.
pub fn is_quit(message: &str) -> bool {
    message == QUIT
}

/// Why a session reached its terminal state.
#[derive(Debug)]
pub enum CloseReason {
    /// Zero-length read.
    PeerClosed,
    ReadFailed(io::Error),
    /// The peer sent the quit sentinel.
    Quit,
    /// Closed from elsewhere (write failure or shutdown).
    Closed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed connection"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {e}"),
            CloseReason::Quit => write!(f, "quit"),
            CloseReason::Closed => write!(f, "closed"),
        }
    }
}

/// Failure to hand a message to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The recipient is not draining its queue fast enough.
    QueueFull,
    /// The recipient's write cycle has ended.
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::QueueFull => write!(f, "outbound queue full"),
            DeliveryError::Closed => write!(f, "recipient closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Server-side state for one connected client.
///
/// Equality is by connection id; `id()` is for display only.
#[derive(Debug)]
pub struct ClientSession {
    conn_id: ConnId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
}

impl ClientSession {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(
        conn_id: ConnId,
        peer: SocketAddr,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(queue_capacity);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            conn_id,
            peer,
            outbound,
            closed,
        });
        (session, rx)
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Display identity, `<ip>:<port>`.
    pub fn id(&self) -> String {
        self.peer.to_string()
    }

    /// Attribution prefix for messages this session sends.
    pub fn display_name(&self) -> String {
        format!("client[{}]:", self.peer.port())
    }

    /// Queue bytes for this session's write cycle without waiting.
    pub fn deliver(&self, payload: Bytes) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Flip the close signal. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has been closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl PartialEq for ClientSession {
    fn eq(&self, other: &Self) -> bool {
        self.conn_id == other.conn_id
    }
}

impl Eq for ClientSession {}

/// Drive the inbound side of a session until it closes.
///
/// Reads into a buffer of `buffer_size` bytes. Every completed read is one
/// message, so anything longer than the buffer arrives as several messages.
/// Removes the session from the registry and closes it before returning.
pub async fn read_cycle<R>(
    session: Arc<ClientSession>,
    mut reader: R,
    registry: Arc<ConnectionRegistry>,
    buffer_size: usize,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(buffer_size);

    let reason = loop {
        let read = tokio::select! {
            biased;
            _ = session.wait_closed() => break CloseReason::Closed,
            read = reader.read_buf(&mut buffer) => read,
        };

        let n = match read {
            Ok(0) => break CloseReason::PeerClosed,
            Ok(n) => n,
            Err(e) => break CloseReason::ReadFailed(e),
        };

        let message = String::from_utf8_lossy(&buffer[..n]).into_owned();
        buffer.clear();

        info!("{}{}", session.display_name(), message);
        broadcast::forward(&registry, &session, &message);

        if is_quit(&message) {
            break CloseReason::Quit;
        }
    };

    registry.remove(&session);
    session.close();
    info!(client = %session.id(), reason = %reason, "Client disconnected");
    reason
}

/// Drive the outbound side of a session until it closes or its queue ends.
///
/// A write failure is fatal for this session only: it is removed from the
/// registry and closed, which also stops its read cycle.
pub async fn write_cycle<W>(
    session: Arc<ClientSession>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    registry: Arc<ConnectionRegistry>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = tokio::select! {
            biased;
            _ = session.wait_closed() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = session.wait_closed() => break,
            written = writer.write_all(&payload) => written,
        };

        if let Err(e) = written {
            warn!(client = %session.id(), error = %e, "Write failed");
            registry.remove(&session);
            session.close();
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(client = %session.id(), error = %e, "Shutdown after close failed");
    }
}
