//! # ridepulse-relay — Real-time room relay for group rides
//!
//! Riders share one WebSocket room per ride: chat, live positions, the
//! leader's route and WebRTC signaling are relayed between members, while
//! the relay keeps presence and leadership authoritative.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌─────────────┐
//! │ RideSession      │ ◄────────────────► │ RelayServer │
//! │  └ Resilient-    │   JSON envelopes   │ (central)   │
//! │    Connection    │                    └──────┬──────┘
//! └──────────────────┘                           │
//!                                         ┌──────┴──────┐
//!                                         │ Relay       │
//!                                         │  └ Registry │
//!                                         │     └ Room  │
//!                                         └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope types
//! - [`room`] / [`registry`] — membership, leadership, room lifecycle
//! - [`router`] — per-type routing policy
//! - [`presence`] — roster snapshots
//! - [`sweeper`] — heartbeat eviction
//! - [`server`] — WebSocket relay server
//! - [`client`] — self-healing WebSocket connection
//! - [`session`] — room membership on top of the connection

pub mod backoff;
pub mod client;
pub mod config;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod router;
pub mod server;
pub mod session;
pub mod sweeper;

// Re-exports for convenience
pub use backoff::Backoff;
pub use client::{ClientError, ConnectionEvent, ConnectionState, ResilientConnection};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use peer::PeerHandle;
pub use protocol::{Incoming, Outgoing, PresenceEntry, ProtocolError, Role};
pub use registry::{RoomRegistry, SharedRoom};
pub use room::Room;
pub use router::{DropReason, Outcome, Relay, Session};
pub use server::{RelayServer, ServerError, ServerStats};
pub use session::{RideSession, SessionEvent};
pub use sweeper::HeartbeatSweeper;

pub use ridepulse_core::{ClientId, RiderLocation, RoomId, RoutePlan, RouteStop};
