//! JSON envelope protocol spoken between riders and the relay.
//!
//! Wire format: one JSON object per WebSocket text frame, discriminated by
//! a kebab-case `type` field, all other fields camelCase:
//! ```text
//! {"type":"chat","roomId":"ride-1","body":"on my way"}
//! {"type":"presence","roomId":"ride-1","clients":[...],"leaderId":"..."}
//! ```
//!
//! [`Incoming`] is what clients send, [`Outgoing`] is what the relay sends.
//! Decoding is strict: an unknown `type` or a missing required field is a
//! [`ProtocolError`], and the caller drops the frame.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ridepulse_core::{ClientId, RiderLocation, RoomId, RoutePlan};

/// Envelopes sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Incoming {
    Join {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rider_id: Option<String>,
    },
    Heartbeat {
        room_id: RoomId,
    },
    Chat {
        room_id: RoomId,
        body: String,
    },
    RtcOffer {
        room_id: RoomId,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ClientId>,
    },
    RtcAnswer {
        room_id: RoomId,
        sdp: String,
        to: ClientId,
    },
    RtcIce {
        room_id: RoomId,
        candidate: serde_json::Value,
        to: ClientId,
    },
    Location {
        room_id: RoomId,
        rider_id: String,
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        ts: f64,
    },
    RouteSet {
        room_id: RoomId,
        route: RoutePlan,
    },
    LeaderTransfer {
        room_id: RoomId,
        to: ClientId,
    },
}

impl Incoming {
    /// Parse one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// The room every envelope is addressed to.
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Join { room_id, .. }
            | Self::Heartbeat { room_id }
            | Self::Chat { room_id, .. }
            | Self::RtcOffer { room_id, .. }
            | Self::RtcAnswer { room_id, .. }
            | Self::RtcIce { room_id, .. }
            | Self::Location { room_id, .. }
            | Self::RouteSet { room_id, .. }
            | Self::LeaderTransfer { room_id, .. } => room_id,
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Chat { .. } => "chat",
            Self::RtcOffer { .. } => "rtc-offer",
            Self::RtcAnswer { .. } => "rtc-answer",
            Self::RtcIce { .. } => "rtc-ice",
            Self::Location { .. } => "location",
            Self::RouteSet { .. } => "route-set",
            Self::LeaderTransfer { .. } => "leader-transfer",
        }
    }

    /// Build a location envelope from a position fix.
    pub fn location(room_id: RoomId, fix: &RiderLocation) -> Self {
        Self::Location {
            room_id,
            rider_id: fix.rider_id.clone(),
            lat: fix.lat,
            lng: fix.lng,
            heading: fix.heading,
            speed: fix.speed,
            ts: fix.ts,
        }
    }
}

/// Role of a member in a presence roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Member,
}

/// One roster line in a `presence` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub role: Role,
    /// Epoch milliseconds of the member's last inbound envelope.
    pub last_seen: u64,
}

/// Envelopes sent by the relay. Relayed types carry `from`, the sender's
/// connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Outgoing {
    Joined {
        room_id: RoomId,
        client_id: ClientId,
        leader_id: ClientId,
    },
    Presence {
        room_id: RoomId,
        clients: Vec<PresenceEntry>,
        leader_id: ClientId,
    },
    Chat {
        room_id: RoomId,
        from: ClientId,
        body: String,
        ts: u64,
    },
    Pong {
        room_id: RoomId,
        ts: u64,
    },
    RtcOffer {
        room_id: RoomId,
        from: ClientId,
        sdp: String,
    },
    RtcAnswer {
        room_id: RoomId,
        from: ClientId,
        sdp: String,
        to: ClientId,
    },
    RtcIce {
        room_id: RoomId,
        from: ClientId,
        candidate: serde_json::Value,
        to: ClientId,
    },
    Location {
        room_id: RoomId,
        rider_id: String,
        from: ClientId,
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        ts: f64,
    },
    RouteSet {
        room_id: RoomId,
        route: RoutePlan,
        from: ClientId,
    },
    LeaderTransfer {
        room_id: RoomId,
        leader_id: ClientId,
    },
}

impl Outgoing {
    /// Serialize to a shareable text frame. One encode serves every
    /// recipient of a broadcast.
    pub fn to_frame(&self) -> Result<Arc<str>, ProtocolError> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a relay frame (client side).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// The position carried by a `location` envelope.
    pub fn rider_location(&self) -> Option<RiderLocation> {
        match self {
            Self::Location {
                rider_id,
                lat,
                lng,
                heading,
                speed,
                ts,
                ..
            } => Some(RiderLocation {
                rider_id: rider_id.clone(),
                lat: *lat,
                lng: *lng,
                heading: *heading,
                speed: *speed,
                ts: *ts,
            }),
            _ => None,
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}
