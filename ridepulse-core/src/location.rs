//! Live rider position samples.

use serde::{Deserialize, Serialize};

/// One position fix for a rider.
///
/// `heading` is degrees clockwise from north and `speed` metres per second;
/// both are absent when the device could not determine them. `ts` is
/// seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderLocation {
    pub rider_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub ts: f64,
}

impl RiderLocation {
    pub fn new(rider_id: impl Into<String>, lat: f64, lng: f64, ts: f64) -> Self {
        Self {
            rider_id: rider_id.into(),
            lat,
            lng,
            heading: None,
            speed: None,
            ts,
        }
    }

    /// Attach heading and speed, dropping negative readings
    /// (platform location APIs report "unknown" as a negative value).
    pub fn with_motion(mut self, heading: f64, speed: f64) -> Self {
        self.heading = (heading >= 0.0).then_some(heading);
        self.speed = (speed >= 0.0).then_some(speed);
        self
    }
}
