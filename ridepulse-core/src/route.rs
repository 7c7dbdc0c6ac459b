//! Shared route plan published by the ride leader.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A named point on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStop {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

impl RouteStop {
    pub fn new(id: impl Into<String>, name: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            lat,
            lng,
        }
    }
}

/// The route a ride is following.
///
/// `updated_at` is seconds since the Unix epoch and is optional on the
/// wire: older clients omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlan {
    pub id: String,
    pub start: RouteStop,
    pub destination: RouteStop,
    #[serde(default)]
    pub stops: Vec<RouteStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polyline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<f64>,
}

impl RoutePlan {
    pub fn new(id: impl Into<String>, start: RouteStop, destination: RouteStop) -> Self {
        Self {
            id: id.into(),
            start,
            destination,
            stops: Vec::new(),
            polyline: None,
            updated_at: None,
        }
    }

    /// Append an intermediate stop.
    pub fn with_stop(mut self, stop: RouteStop) -> Self {
        self.stops.push(stop);
        self
    }

    /// Stamp the plan with the current wall-clock time.
    pub fn touch(&mut self) {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.updated_at = Some(secs);
    }

    /// All stops in travel order: start, intermediates, destination.
    pub fn waypoints(&self) -> impl Iterator<Item = &RouteStop> {
        std::iter::once(&self.start)
            .chain(self.stops.iter())
            .chain(std::iter::once(&self.destination))
    }
}
