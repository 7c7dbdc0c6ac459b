//! Server and client configuration.
//!
//! Defaults carry the design values: sweep every 5 s, evict after 30 s of
//! silence, client keepalive every 15 s, backoff capped at 30 s.

use std::time::Duration;

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before new ones are dropped
    pub outbound_capacity: usize,
    /// Heartbeat sweeper tick
    pub sweep_interval: Duration,
    /// Silence after which a member is evicted
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            outbound_capacity: 256,
            sweep_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment.
    ///
    /// | Variable                           | Default   |
    /// |------------------------------------|-----------|
    /// | `PORT`                             | `8080`    |
    /// | `RIDEPULSE_HOST`                   | `0.0.0.0` |
    /// | `RIDEPULSE_SWEEP_INTERVAL_SECS`    | `5`       |
    /// | `RIDEPULSE_HEARTBEAT_TIMEOUT_SECS` | `30`      |
    /// | `RIDEPULSE_OUTBOUND_CAPACITY`      | `256`     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("RIDEPULSE_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_var(&lookup, "PORT")?.unwrap_or(8080);
        let sweep_secs: Option<u64> = parse_var(&lookup, "RIDEPULSE_SWEEP_INTERVAL_SECS")?;
        let timeout_secs: Option<u64> = parse_var(&lookup, "RIDEPULSE_HEARTBEAT_TIMEOUT_SECS")?;
        let capacity: Option<usize> = parse_var(&lookup, "RIDEPULSE_OUTBOUND_CAPACITY")?;

        let config = Self {
            bind_addr: format!("{host}:{port}"),
            outbound_capacity: capacity.unwrap_or(defaults.outbound_capacity),
            sweep_interval: sweep_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            heartbeat_timeout: timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "RIDEPULSE_SWEEP_INTERVAL_SECS",
                reason: "must be greater than zero".into(),
            });
        }
        if self.heartbeat_timeout < self.sweep_interval {
            return Err(ConfigError::Invalid {
                key: "RIDEPULSE_HEARTBEAT_TIMEOUT_SECS",
                reason: "must not be shorter than the sweep interval".into(),
            });
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "RIDEPULSE_OUTBOUND_CAPACITY",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: format!("{raw:?}: {e}"),
            }),
    }
}

/// Resilient client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Relay WebSocket URL, e.g. `ws://localhost:8080`
    pub url: String,
    /// Protocol ping interval while connected
    pub keepalive_interval: Duration,
    /// Backoff unit: attempt `n` waits `unit * 2^n` before jitter
    pub backoff_unit: Duration,
    /// Backoff ceiling before jitter
    pub max_backoff: Duration,
    /// Application heartbeat interval used by `RideSession`
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keepalive_interval: Duration::from_secs(15),
            backoff_unit: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
