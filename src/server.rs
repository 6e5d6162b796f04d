//! TCP server for the chat relay.
//!
//! Accepts connections, turns each into a `ClientSession` with its own read
//! and write cycles, and tears everything down on shutdown.

use crate::broadcast;
use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::session::{self, ClientSession, ConnId};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Listen backlog for the relay socket
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server-fatal errors
#[derive(Debug)]
pub enum ServerError {
    /// The listening socket could not be created or bound.
    Bind(String, io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind '{addr}': {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) => Some(e),
        }
    }
}

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    next_conn_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Server {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            next_conn_id: AtomicU64::new(1),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listen = self.config.listen_addr();
        let addr = tokio::net::lookup_host(listen.as_str())
            .await
            .map_err(|e| ServerError::Bind(listen.clone(), e))?
            .next()
            .ok_or_else(|| {
                ServerError::Bind(
                    listen.clone(),
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
                )
            })?;

        let listener = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(listen.clone(), e))?;

        let local = listener.local_addr().unwrap_or(addr);
        info!(address = %local, "Server listening");
        Ok(listener)
    }

    /// Bind, accept until Ctrl-C or `shutdown`, then tear down.
    pub async fn start(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;

        tokio::spawn(shutdown_on_signal(Arc::clone(&self), tokio::signal::ctrl_c()));

        self.serve(listener).await;
        Ok(())
    }

    /// Run the accept loop on `listener` until shutdown.
    ///
    /// The listener is dropped (closed) when this returns.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown_rx) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    // Admission runs on its own task so the next accept is
                    // armed immediately.
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.admit(stream, peer).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        // Sessions were closed by `shutdown`; admissions still in flight are
        // refused by the closed registry.
        drop(listener);
        info!("Accept loop stopped");
    }

    /// Stop accepting and close every session. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let closed = self.registry.close_all();
        info!(sessions = closed, "Server shutting down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a freshly accepted connection and run it to completion.
    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let (session, outbound) =
            ClientSession::new(self.next_conn_id(), peer, self.config.outbound_queue);

        if !self.registry.add(Arc::clone(&session)) {
            warn!(client = %session.id(), "Connection refused during shutdown");
            session.close();
            return;
        }
        info!(client = %session.id(), "Client connected");

        let (reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(session::write_cycle(
            Arc::clone(&session),
            writer,
            outbound,
            Arc::clone(&self.registry),
        ));

        session::read_cycle(
            Arc::clone(&session),
            reader,
            Arc::clone(&self.registry),
            self.config.buffer_size,
        )
        .await;

        if self.config.notify_departures && !self.is_shutdown() {
            broadcast::announce_departure(&self.registry, &session);
        }

        if let Err(e) = writer_task.await {
            warn!(client = %session.id(), error = %e, "Write cycle aborted");
        }
    }
}

/// Shut the server down once `signal` fires.
///
/// If the signal cannot be listened for, the server keeps running.
async fn shutdown_on_signal<F>(server: Arc<Server>, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!(error = %e, "Failed to listen for termination signal");
        return;
    }
    info!("Termination signal received");
    server.shutdown();
}

/// Resolves once shutdown has been signalled
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // The sender is owned by the server, which outlives the accept loop.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Build a non-blocking listener with address reuse
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
