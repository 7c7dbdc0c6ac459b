//! Heartbeat sweeper: periodic eviction of silent members.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::router::Relay;

/// Evicts members whose last inbound envelope is older than `timeout`,
/// checking every `tick`.
pub struct HeartbeatSweeper {
    relay: Arc<Relay>,
    tick: Duration,
    timeout: Duration,
}

impl HeartbeatSweeper {
    pub fn new(relay: Arc<Relay>, tick: Duration, timeout: Duration) -> Self {
        Self {
            relay,
            tick,
            timeout,
        }
    }

    /// Run one sweep at `now`. Returns the number of evicted members.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        self.relay.sweep(now, self.timeout).await
    }

    /// Sweep on every tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        log::info!(
            "Heartbeat sweeper started (tick {:?}, timeout {:?})",
            self.tick,
            self.timeout
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_at(Instant::now()).await;
                    if evicted > 0 {
                        log::info!("Sweep evicted {evicted} members");
                    }
                }
            }
        }
        log::info!("Heartbeat sweeper stopped");
    }
}
