//! Ride session: one rider's membership in one room, on top of a
//! [`ResilientConnection`].
//!
//! - Sends `join` on every (re)connect, so a relay restart or eviction is
//!   healed without the application noticing
//! - Sends `heartbeat` on a fixed interval while connected
//! - Tracks this connection's client id and the room leader
//! - Decodes relay frames into typed [`SessionEvent`]s

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, ConnectionEvent, ResilientConnection};
use crate::config::ClientConfig;
use crate::protocol::{Incoming, Outgoing};
use ridepulse_core::{ClientId, RiderLocation, RoomId, RoutePlan};

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport up; `join` has been sent
    Connected,
    /// Session stopped
    Disconnected,
    /// Relay envelope
    Envelope(Outgoing),
    /// Transport failure; the connection is retrying
    Error(ClientError),
}

#[derive(Debug, Default)]
struct Identity {
    client_id: Option<ClientId>,
    leader_id: Option<ClientId>,
}

impl Identity {
    fn observe(&mut self, envelope: &Outgoing) {
        match envelope {
            Outgoing::Joined {
                client_id,
                leader_id,
                ..
            } => {
                self.client_id = Some(client_id.clone());
                self.leader_id = Some(leader_id.clone());
            }
            Outgoing::Presence { leader_id, .. } | Outgoing::LeaderTransfer { leader_id, .. } => {
                self.leader_id = Some(leader_id.clone());
            }
            _ => {}
        }
    }
}

pub struct RideSession {
    room_id: RoomId,
    rider_id: Option<String>,
    config: ClientConfig,
    connection: ResilientConnection,
    identity: Arc<RwLock<Identity>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    tasks: CancellationToken,
}

impl RideSession {
    pub fn new(config: ClientConfig, room_id: impl Into<RoomId>, rider_id: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            room_id: room_id.into(),
            rider_id,
            connection: ResilientConnection::new(config.clone()),
            config,
            identity: Arc::new(RwLock::new(Identity::default())),
            event_tx,
            event_rx: Some(event_rx),
            tasks: CancellationToken::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect and keep the room membership alive until [`stop`](Self::stop).
    ///
    /// A session is single-use: once stopped it cannot be restarted, and
    /// `start()` returns [`ClientError::Stopped`]. Starting a running
    /// session again is a no-op.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.tasks.is_cancelled() {
            return Err(ClientError::Stopped);
        }
        let Some(connection_rx) = self.connection.take_event_rx() else {
            return Ok(());
        };

        tokio::spawn(pump(
            connection_rx,
            self.connection.clone(),
            self.join_envelope(),
            self.identity.clone(),
            self.event_tx.clone(),
            self.tasks.clone(),
        ));
        tokio::spawn(heartbeat(
            self.connection.clone(),
            self.room_id.clone(),
            self.config.heartbeat_interval,
            self.tasks.clone(),
        ));

        self.connection.connect().await;
        log::info!("Ride session for room {} started", self.room_id);
        Ok(())
    }

    /// Stop heartbeats and close the connection for good.
    pub async fn stop(&self) {
        if self.tasks.is_cancelled() {
            return;
        }
        self.tasks.cancel();
        self.connection.disconnect().await;
        let _ = self.event_tx.send(SessionEvent::Disconnected);
        log::info!("Ride session for room {} stopped", self.room_id);
    }

    pub async fn send_chat(&self, body: impl Into<String>) -> Result<(), ClientError> {
        self.send(Incoming::Chat {
            room_id: self.room_id.clone(),
            body: body.into(),
        })
        .await
    }

    pub async fn send_location(&self, fix: &RiderLocation) -> Result<(), ClientError> {
        self.send(Incoming::location(self.room_id.clone(), fix)).await
    }

    /// Publish a route, stamped with the current time. The relay ignores
    /// it unless this client leads.
    pub async fn set_route(&self, mut route: RoutePlan) -> Result<(), ClientError> {
        route.touch();
        self.send(Incoming::RouteSet {
            room_id: self.room_id.clone(),
            route,
        })
        .await
    }

    /// Hand leadership to another member. Only honored from the leader.
    pub async fn transfer_leadership(&self, to: ClientId) -> Result<(), ClientError> {
        self.send(Incoming::LeaderTransfer {
            room_id: self.room_id.clone(),
            to,
        })
        .await
    }

    /// `to: None` broadcasts the offer to the rest of the room.
    pub async fn send_offer(
        &self,
        sdp: impl Into<String>,
        to: Option<ClientId>,
    ) -> Result<(), ClientError> {
        self.send(Incoming::RtcOffer {
            room_id: self.room_id.clone(),
            sdp: sdp.into(),
            to,
        })
        .await
    }

    pub async fn send_answer(&self, sdp: impl Into<String>, to: ClientId) -> Result<(), ClientError> {
        self.send(Incoming::RtcAnswer {
            room_id: self.room_id.clone(),
            sdp: sdp.into(),
            to,
        })
        .await
    }

    pub async fn send_ice(
        &self,
        candidate: serde_json::Value,
        to: ClientId,
    ) -> Result<(), ClientError> {
        self.send(Incoming::RtcIce {
            room_id: self.room_id.clone(),
            candidate,
            to,
        })
        .await
    }

    async fn send(&self, envelope: Incoming) -> Result<(), ClientError> {
        self.connection.send_envelope(&envelope).await
    }

    /// This connection's id, known after the first `joined` ack.
    pub async fn client_id(&self) -> Option<ClientId> {
        self.identity.read().await.client_id.clone()
    }

    pub async fn leader_id(&self) -> Option<ClientId> {
        self.identity.read().await.leader_id.clone()
    }

    pub async fn is_leader(&self) -> bool {
        let identity = self.identity.read().await;
        identity.client_id.is_some() && identity.client_id == identity.leader_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn connection(&self) -> &ResilientConnection {
        &self.connection
    }

    fn join_envelope(&self) -> Incoming {
        Incoming::Join {
            room_id: self.room_id.clone(),
            rider_id: self.rider_id.clone(),
        }
    }
}

/// Translate connection events into session events.
async fn pump(
    mut connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    connection: ResilientConnection,
    join: Incoming,
    identity: Arc<RwLock<Identity>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    tasks: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = tasks.cancelled() => break,
            event = connection_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let forwarded = match event {
            ConnectionEvent::Connected => {
                // A new connection gets a new id from the relay.
                *identity.write().await = Identity::default();
                if let Err(e) = connection.send_envelope(&join).await {
                    log::warn!("Failed to send join: {e}");
                }
                Some(SessionEvent::Connected)
            }
            ConnectionEvent::Text(text) => match Outgoing::decode(&text) {
                Ok(envelope) => {
                    identity.write().await.observe(&envelope);
                    Some(SessionEvent::Envelope(envelope))
                }
                Err(e) => {
                    log::debug!("Ignoring undecodable relay frame: {e}");
                    None
                }
            },
            ConnectionEvent::Message(data) => {
                log::debug!("Ignoring {} byte binary frame", data.len());
                None
            }
            ConnectionEvent::Error(err) => Some(SessionEvent::Error(err)),
            // `stop()` reports this itself.
            ConnectionEvent::Disconnected => None,
        };

        if let Some(event) = forwarded {
            if event_tx.send(event).is_err() {
                break;
            }
        }
    }
}

async fn heartbeat(
    connection: ResilientConnection,
    room_id: RoomId,
    period: std::time::Duration,
    tasks: CancellationToken,
) {
    let mut ticker = interval(period.max(std::time::Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let envelope = Incoming::Heartbeat { room_id };
    loop {
        tokio::select! {
            _ = tasks.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !connection.is_connected().await {
            continue;
        }
        if let Err(e) = connection.send_envelope(&envelope).await {
            log::debug!("Heartbeat not sent: {e}");
        }
    }
}
