use chrono::Utc;
use meshcell_bus::Bus;
use meshcell_core::{topics, Heartbeat, HeartbeatStatus, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stats::StatsHandle;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Publishes `agent.<id>.status` on a fixed interval, independent of task load.
pub struct HeartbeatService {
    agent_id: String,
    interval: Duration,
    started: Instant,
    stats: StatsHandle,
    bus: Arc<dyn Bus>,
}

impl HeartbeatService {
    pub fn new(
        agent_id: &str,
        interval: Duration,
        started: Instant,
        stats: StatsHandle,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            interval: interval.max(MIN_INTERVAL),
            started,
            stats,
            bus,
        }
    }

    pub fn heartbeat(&self, status: HeartbeatStatus) -> Heartbeat {
        Heartbeat {
            agent_id: self.agent_id.clone(),
            status,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            tasks_processed: self.stats.processed(),
            timestamp: Utc::now(),
        }
    }

    pub async fn beat(&self, status: HeartbeatStatus) -> Result<()> {
        let heartbeat = self.heartbeat(status);
        debug!(agent_id = %self.agent_id, status = %status, "Heartbeat");
        self.bus
            .publish(&topics::status(&self.agent_id), serde_json::to_value(&heartbeat)?)
            .await
    }

    /// Beat `alive` immediately and then every interval until cancelled.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            agent_id = %self.agent_id,
            interval_ms = self.interval.as_millis() as u64,
            "Heartbeat started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.beat(HeartbeatStatus::Alive).await {
                        warn!(agent_id = %self.agent_id, error = %e, "Heartbeat publish failed");
                    }
                }
            }
        }
        debug!(agent_id = %self.agent_id, "Heartbeat stopped");
    }
}
