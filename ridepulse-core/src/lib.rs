//! # ridepulse-core — Shared ride domain types
//!
//! Identifiers and payloads exchanged between the relay and its clients.
//! Everything here is plain data with serde support; transport and room
//! state live in `ridepulse-relay`.

pub mod ids;
pub mod location;
pub mod route;

pub use ids::{ClientId, RoomId};
pub use location::RiderLocation;
pub use route::{RoutePlan, RouteStop};
