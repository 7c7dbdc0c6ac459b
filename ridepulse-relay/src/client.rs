//! Resilient WebSocket connection for relay clients.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Exponential backoff with jitter between attempts
//! - Protocol-level keepalive pings
//! - An event stream that hides reconnect churn from the application
//!
//! ```text
//!              connect()
//! Disconnected ─────────► Connecting ──accept──► Connected
//!      ▲                     │  ▲                   │
//!      │ disconnect()  error │  │ backoff           │ error
//!      │                     ▼  │                   │
//!      └──────────────── Failed(reason) ◄───────────┘
//! ```
//!
//! Each live transport runs exactly two tasks, a receive loop and a
//! keepalive loop, both children of one cancellation token. The token is
//! cancelled before every reconnect and on `disconnect()`, so no loop ever
//! outlives its socket. Every event carries the connection generation it
//! was produced under; `disconnect()` bumps the generation, which silences
//! anything still in flight.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::protocol::{Incoming, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

/// Events emitted by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Transport accepted
    Connected,
    /// `disconnect()` completed
    Disconnected,
    /// Binary frame
    Message(Vec<u8>),
    /// Text frame
    Text(String),
    /// Transport failed; a reconnect is scheduled
    Error(ClientError),
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("session stopped")]
    Stopped,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Shared {
    state: ConnectionState,
    /// Owner intent; false after `disconnect()`.
    should_reconnect: bool,
    /// Failures since the last successful frame.
    attempts: u32,
    /// Bumped by every `connect()` and `disconnect()`.
    generation: u64,
    /// Root token of the current `connect()` call.
    lifecycle: Option<CancellationToken>,
    sink: Option<Arc<Mutex<WsSink>>>,
    failures: Option<mpsc::UnboundedSender<ClientError>>,
}

struct Inner {
    config: ClientConfig,
    backoff: Backoff,
    shared: Mutex<Shared>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

/// One logical, self-healing connection to the relay.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ResilientConnection {
    inner: Arc<Inner>,
}

impl ResilientConnection {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(config.backoff_unit, config.max_backoff);
        Self {
            inner: Arc::new(Inner {
                config,
                backoff,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    should_reconnect: false,
                    attempts: 0,
                    generation: 0,
                    lifecycle: None,
                    sink: None,
                    failures: None,
                }),
                event_tx,
                event_rx: std::sync::Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.inner.event_rx.lock().ok()?.take()
    }

    /// Start connecting and keep reconnecting until `disconnect()`.
    ///
    /// Returns immediately; progress is reported on the event stream.
    /// Calling it while already active is a no-op.
    pub async fn connect(&self) {
        let (lifecycle, generation) = {
            let mut shared = self.inner.shared.lock().await;
            if shared.should_reconnect {
                return;
            }
            shared.should_reconnect = true;
            shared.generation += 1;
            shared.attempts = 0;
            let lifecycle = CancellationToken::new();
            shared.lifecycle = Some(lifecycle.clone());
            (lifecycle, shared.generation)
        };
        log::info!("Connecting to {}", self.inner.config.url);
        tokio::spawn(self.inner.clone().supervise(lifecycle, generation));
    }

    /// Stop reconnecting, cancel both loops and close the transport.
    ///
    /// Idempotent: a second call, or a call while already disconnected,
    /// does nothing.
    pub async fn disconnect(&self) {
        let sink = {
            let mut shared = self.inner.shared.lock().await;
            if !shared.should_reconnect && shared.state == ConnectionState::Disconnected {
                return;
            }
            shared.should_reconnect = false;
            shared.generation += 1;
            if let Some(lifecycle) = shared.lifecycle.take() {
                lifecycle.cancel();
            }
            shared.state = ConnectionState::Disconnected;
            shared.failures = None;
            let _ = self.inner.event_tx.send(ConnectionEvent::Disconnected);
            shared.sink.take()
        };

        if let Some(sink) = sink {
            let _ = timeout(CLOSE_TIMEOUT, async { sink.lock().await.close().await }).await;
        }
        log::info!("Disconnected from {}", self.inner.config.url);
    }

    /// Send a text frame. Only valid while connected; a transport failure
    /// triggers the reconnect path and is also returned.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(Message::Text(text.into().into())).await
    }

    /// Send a binary frame.
    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), ClientError> {
        self.send(Message::Binary(data.into())).await
    }

    /// Encode and send a relay envelope.
    pub async fn send_envelope(&self, envelope: &Incoming) -> Result<(), ClientError> {
        let text = envelope.encode()?;
        self.send_text(text).await
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        let (sink, failures) = {
            let shared = self.inner.shared.lock().await;
            if shared.state != ConnectionState::Connected {
                return Err(ClientError::NotConnected);
            }
            let sink = shared.sink.clone().ok_or(ClientError::NotConnected)?;
            (sink, shared.failures.clone())
        };

        let result = sink.lock().await.send(message).await;
        if let Err(e) = result {
            let err = ClientError::Transport(e.to_string());
            if let Some(failures) = failures {
                let _ = failures.send(err.clone());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Get the current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.shared.lock().await.state.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Failures since the last successful frame.
    pub async fn attempts(&self) -> u32 {
        self.inner.shared.lock().await.attempts
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }
}

impl Inner {
    /// Connect, run, back off, repeat, until the lifecycle is cancelled.
    async fn supervise(self: Arc<Self>, lifecycle: CancellationToken, generation: u64) {
        loop {
            if !self.begin_attempt(generation).await {
                break;
            }

            let connected = tokio::select! {
                _ = lifecycle.cancelled() => break,
                result = tokio_tungstenite::connect_async(self.config.url.as_str()) => result,
            };

            let failure = match connected {
                Ok((ws_stream, _)) => match self.run_transport(ws_stream, &lifecycle, generation).await {
                    Some(err) => err,
                    None => break,
                },
                Err(e) => ClientError::Connect(e.to_string()),
            };

            let Some(delay) = self.record_failure(generation, failure).await else {
                break;
            };
            log::debug!("Reconnecting to {} in {delay:?}", self.config.url);
            tokio::select! {
                _ = lifecycle.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::debug!("Connection supervisor for {} stopped", self.config.url);
    }

    async fn begin_attempt(&self, generation: u64) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.generation != generation || !shared.should_reconnect {
            return false;
        }
        shared.state = ConnectionState::Connecting;
        true
    }

    /// Drive one accepted transport until it fails (`Some`) or the
    /// lifecycle is cancelled (`None`).
    async fn run_transport(
        self: &Arc<Self>,
        ws_stream: WsStream,
        lifecycle: &CancellationToken,
        generation: u64,
    ) -> Option<ClientError> {
        let (sink, stream) = ws_stream.split();
        let sink = Arc::new(Mutex::new(sink));
        let session = lifecycle.child_token();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();

        {
            let mut shared = self.shared.lock().await;
            if shared.generation != generation || !shared.should_reconnect {
                drop(shared);
                let _ = timeout(CLOSE_TIMEOUT, async { sink.lock().await.close().await }).await;
                return None;
            }
            shared.state = ConnectionState::Connected;
            shared.sink = Some(sink.clone());
            shared.failures = Some(failure_tx.clone());
            let _ = self.event_tx.send(ConnectionEvent::Connected);
        }
        log::info!("Connected to {}", self.config.url);

        let receiver = tokio::spawn(self.clone().receive_loop(
            stream,
            session.clone(),
            failure_tx.clone(),
            generation,
        ));
        let keepalive = tokio::spawn(self.clone().keepalive_loop(
            sink.clone(),
            session.clone(),
            failure_tx,
            generation,
        ));

        let outcome = tokio::select! {
            _ = session.cancelled() => None,
            err = failure_rx.recv() => Some(err.unwrap_or(ClientError::Closed)),
        };

        // Both loops must be gone before a new transport is opened.
        session.cancel();
        let _ = receiver.await;
        let _ = keepalive.await;

        {
            let mut shared = self.shared.lock().await;
            if shared.generation == generation {
                shared.sink = None;
                shared.failures = None;
            }
        }
        let _ = timeout(CLOSE_TIMEOUT, async { sink.lock().await.close().await }).await;
        outcome
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut stream: WsSource,
        session: CancellationToken,
        failures: mpsc::UnboundedSender<ClientError>,
        generation: u64,
    ) {
        loop {
            let frame = tokio::select! {
                _ = session.cancelled() => return,
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(Message::Close(_))) | None => {
                    let _ = failures.send(ClientError::Closed);
                    return;
                }
                Some(Ok(message)) => {
                    let event = match message {
                        Message::Text(text) => Some(ConnectionEvent::Text(text.as_str().to_owned())),
                        Message::Binary(data) => Some(ConnectionEvent::Message(data.to_vec())),
                        _ => None,
                    };
                    self.on_traffic(generation, event).await;
                }
                Some(Err(e)) => {
                    if !session.is_cancelled() {
                        let _ = failures.send(ClientError::Transport(e.to_string()));
                    }
                    return;
                }
            }
        }
    }

    async fn keepalive_loop(
        self: Arc<Self>,
        sink: Arc<Mutex<WsSink>>,
        session: CancellationToken,
        failures: mpsc::UnboundedSender<ClientError>,
        generation: u64,
    ) {
        let period = self.config.keepalive_interval.max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !self.is_current_and_connected(generation).await {
                continue;
            }
            let result = sink.lock().await.send(Message::Ping(Default::default())).await;
            match result {
                Ok(()) => log::trace!("Keepalive ping sent to {}", self.config.url),
                Err(e) => {
                    if !session.is_cancelled() {
                        let _ = failures.send(ClientError::Transport(e.to_string()));
                    }
                    return;
                }
            }
        }
    }

    /// Successful inbound traffic: reset backoff and forward the frame.
    async fn on_traffic(&self, generation: u64, event: Option<ConnectionEvent>) {
        let mut shared = self.shared.lock().await;
        if shared.generation != generation || !shared.should_reconnect {
            return;
        }
        shared.attempts = 0;
        shared.state = ConnectionState::Connected;
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
    }

    /// Record a transport failure and return the backoff delay, or `None`
    /// if the owner has disconnected meanwhile.
    async fn record_failure(&self, generation: u64, err: ClientError) -> Option<Duration> {
        let mut shared = self.shared.lock().await;
        if shared.generation != generation || !shared.should_reconnect {
            return None;
        }
        shared.attempts = shared.attempts.saturating_add(1);
        shared.state = ConnectionState::Failed(err.to_string());
        log::warn!(
            "Connection to {} failed (attempt {}): {err}",
            self.config.url,
            shared.attempts
        );
        let _ = self.event_tx.send(ConnectionEvent::Error(err));
        Some(self.backoff.delay(shared.attempts))
    }

    async fn is_current_and_connected(&self, generation: u64) -> bool {
        let shared = self.shared.lock().await;
        shared.generation == generation && shared.state == ConnectionState::Connected
    }
}
