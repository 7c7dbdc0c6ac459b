//! WebSocket relay server with room-based fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── PeerHandle A ── writer ──► A
//!             ├── reader ── Relay ───┼── PeerHandle B ── writer ──► B
//! Client B ──┘               │       └── PeerHandle C ── writer ──► C
//!                            │
//!                     RoomRegistry ◄── HeartbeatSweeper (every tick)
//! ```
//!
//! Each connection runs two tasks:
//! - A reader that decodes envelopes and hands them to the [`Relay`]
//! - A writer that drains the connection's bounded outbound queue
//!
//! A slow client only ever fills its own queue. Eviction by the sweeper
//! cancels the connection's token, which ends both tasks.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::peer::PeerHandle;
use crate::protocol::Incoming;
use crate::router::{Outcome, Relay, Session};
use crate::sweeper::HeartbeatSweeper;
use ridepulse_core::ClientId;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Envelopes decoded and dispatched
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Envelopes the router declined to deliver
    pub dropped_messages: u64,
    /// Frames that were not valid envelopes
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

/// Live counters behind [`ServerStats`]. Updated lock-free from every
/// connection task so rooms never contend on bookkeeping.
#[derive(Debug, Default)]
struct StatsCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    dropped_messages: AtomicU64,
    malformed_messages: AtomicU64,
}

impl StatsCounters {
    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn message(&self, bytes: usize, dropped: bool) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if dropped {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            active_rooms: 0,
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    /// Server-wide statistics
    stats: Arc<StatsCounters>,
    /// Cancelled by [`shutdown`](Self::shutdown)
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            relay: Arc::new(Relay::new()),
            stats: Arc::new(StatsCounters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        let sweeper = HeartbeatSweeper::new(
            self.relay.clone(),
            self.config.sweep_interval,
            self.config.heartbeat_timeout,
        );
        tokio::spawn(sweeper.run(self.shutdown.child_token()));

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            };
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, relay, stats, config, shutdown).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }

        log::info!("Relay server stopped");
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<Relay>,
        stats: Arc<StatsCounters>,
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let client_id = ClientId::generate();
        let (peer, mut outbound) = PeerHandle::channel(config.outbound_capacity);
        let closing = peer.shutdown_token();
        let mut session = Session::new(client_id.clone(), peer.clone());

        log::info!("WebSocket connection {client_id} established from {addr}");
        stats.connection_opened();

        let writer_closing = closing.clone();
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_closing.cancelled() => break,
                    frame = outbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if ws_sender.send(Message::text(frame.to_string())).await.is_err() {
                    // Let the reader notice.
                    writer_closing.cancel();
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        loop {
            tokio::select! {
                _ = closing.cancelled() => {
                    log::info!("Closing connection {client_id} ({addr})");
                    break;
                }
                _ = shutdown.cancelled() => break,
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Incoming::decode(text.as_str()) {
                            Ok(envelope) => {
                                let outcome = relay.dispatch(&mut session, envelope).await;
                                stats.message(text.as_str().len(), matches!(outcome, Outcome::Dropped(_)));
                            }
                            Err(e) => {
                                log::debug!("Dropping frame from {client_id}: {e}");
                                stats.malformed();
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Dropping {} byte binary frame from {client_id}", data.len());
                        stats.malformed();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {client_id} closed from {addr}");
                        break;
                    }
                    // Pings are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                },
            }
        }

        relay.leave(&mut session).await;
        peer.close();
        let _ = writer.await;

        stats.connection_closed();
        Ok(())
    }

    /// Stop accepting, close every connection and stop the sweeper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.snapshot();
        stats.active_rooms = self.relay.registry().room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}
