//! Accept loop and the map of live connections.
//!
//! The [`Listener`] owns the server socket and a concurrent map from session id
//! to [`Connection`]. The accept path is the only writer that inserts into the
//! map. Each connection's close notification is the only path that removes
//! from it, and it removes the entry only while that entry still refers to the
//! closing connection.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionOptions};
use crate::platform::{SocketConfig, bind_listener, configure_stream};
use crate::registry::PacketRegistry;
use crate::session::{PacketCodecFactory, Session, SessionFactory, SessionId};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

type ConnectionMap<S> = DashMap<SessionId, Arc<Connection<S>>>;

/// Configuration for [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Live connections above which new sockets are refused. Default: 1024.
    pub max_connections: usize,
    /// Close connections that send nothing for this long. Default: none.
    pub idle_timeout: Option<Duration>,
    /// Outbound frames each connection may queue. Default: 256.
    pub outbound_queue_capacity: usize,
    /// Options for the listening and accepted sockets.
    pub socket: SocketConfig,
    /// Consecutive accept failures after which the listening socket is
    /// considered broken. Default: 32.
    pub max_consecutive_accept_errors: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_connections: 1024,
            idle_timeout: None,
            outbound_queue_capacity: 256,
            socket: SocketConfig::default(),
            max_consecutive_accept_errors: 32,
        }
    }
}

impl ListenerConfig {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            idle_timeout: self.idle_timeout,
            outbound_queue_capacity: self.outbound_queue_capacity,
        }
    }
}

/// Errors that prevent a listener from serving.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts clients and tracks one [`Connection`] per session.
pub struct Listener<S: Session> {
    config: ListenerConfig,
    registry: Arc<PacketRegistry<S>>,
    sessions: Box<dyn SessionFactory<S>>,
    codecs: Box<dyn PacketCodecFactory<S>>,
    connections: Arc<ConnectionMap<S>>,
    local_addr: OnceLock<SocketAddr>,
}

impl<S: Session> Listener<S> {
    pub fn new(
        config: ListenerConfig,
        registry: Arc<PacketRegistry<S>>,
        sessions: impl SessionFactory<S>,
        codecs: impl PacketCodecFactory<S>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            sessions: Box::new(sessions),
            codecs: Box::new(codecs),
            connections: Arc::new(DashMap::new()),
            local_addr: OnceLock::new(),
        })
    }

    /// Bind the configured address and spawn the accept loop.
    ///
    /// The loop runs until `cancel` fires or the listening socket fails for
    /// good, then closes every tracked connection before the handle resolves.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>, ListenerError> {
        let addr = self.config.bind_addr;
        let listener = bind_listener(addr, &self.config.socket)
            .map_err(|source| ListenerError::Bind { addr, source })?;
        Ok(tokio::spawn(Arc::clone(self).serve(listener, cancel)))
    }

    /// Run the accept loop on an already-bound socket, then drain.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => {
                let _ = self.local_addr.set(addr);
                tracing::info!("Listening on {addr}");
            }
            Err(e) => tracing::warn!("Listening on unknown address: {e}"),
        }

        let mut consecutive_errors = 0u32;
        let mut backoff = ACCEPT_BACKOFF_MIN;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    consecutive_errors = 0;
                    backoff = ACCEPT_BACKOFF_MIN;
                    self.admit(stream, peer, &cancel);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.config.max_consecutive_accept_errors {
                        tracing::error!(
                            "Giving up after {consecutive_errors} consecutive accept errors: {e}"
                        );
                        break;
                    }
                    tracing::warn!("Accept failed ({consecutive_errors} in a row): {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            }
        }

        drop(listener);
        self.close_all().await;
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: SessionId) -> Option<Arc<Connection<S>>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Close every tracked connection and wait for their teardown.
    pub async fn close_all(&self) {
        let open: Vec<Arc<Connection<S>>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if !open.is_empty() {
            tracing::info!("Closing {} connections", open.len());
        }
        futures::future::join_all(open.iter().map(|connection| connection.close())).await;
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        if self.connections.len() >= self.config.max_connections {
            tracing::warn!(peer = %peer, "Connection limit reached, refusing client");
            return;
        }
        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            tracing::warn!(peer = %peer, "Failed to configure socket: {e}");
        }
        tokio::spawn(Arc::clone(self).handle_connection(stream, peer, cancel.child_token()));
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }

        let session = Arc::new(self.sessions.create());
        let codec = self.codecs.create(&session);
        let (reader, writer) = stream.into_split();
        let connection = Connection::new(
            session,
            peer,
            reader,
            writer,
            codec,
            Arc::clone(&self.registry),
            &self.config.connection_options(),
            cancel,
        );

        let map: Weak<ConnectionMap<S>> = Arc::downgrade(&self.connections);
        connection.set_close_notify(move |closed: &Connection<S>| {
            if let Some(map) = map.upgrade() {
                map.remove_if(&closed.id(), |_, entry| std::ptr::eq(Arc::as_ptr(entry), closed));
            }
        });

        let id = connection.id();
        let inserted = match self.connections.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
                true
            }
        };

        if !inserted {
            tracing::error!(session = %id, peer = %peer, "Duplicated session id, closing new connection");
            connection.close().await;
            return;
        }

        tracing::info!(session = %id, peer = %peer, "Accepted connection");
        connection.begin_receiving();
    }
}
