use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::{Coordinator, Heartbeat};

const INSTANCE_PREFIX: &str = "instances:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
}

/// Liveness record of one replica, stored as JSON under
/// `instances:<instance_id>` and kept alive by heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    /// Unix seconds.
    pub started_at: f64,
    /// Unix seconds.
    pub last_heartbeat: f64,
    pub status: InstanceStatus,
}

fn instance_key(instance_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{instance_id}")
}

impl Coordinator {
    fn record(&self, status: InstanceStatus) -> InstanceRecord {
        InstanceRecord {
            instance_id: self.inner.instance_id.clone(),
            host: self.inner.config.host.clone(),
            port: self.inner.config.port,
            started_at: self.inner.started_at,
            last_heartbeat: self.now_secs(),
            status,
        }
    }

    async fn write_record(&self, status: InstanceStatus) -> Result<(), serde_json::Error> {
        let record = serde_json::to_string(&self.record(status))?;
        self.store()
            .set(
                &instance_key(&self.inner.instance_id),
                &record,
                Some(self.inner.config.instance_ttl),
            )
            .await;
        Ok(())
    }

    /// Write this instance's record once.
    pub async fn register(&self) -> Result<(), serde_json::Error> {
        self.write_record(InstanceStatus::Active).await?;
        tracing::info!(
            instance_id = %self.inner.instance_id,
            host = %self.inner.config.host,
            port = self.inner.config.port,
            ttl_s = self.inner.config.instance_ttl.as_secs(),
            "instance registered"
        );
        Ok(())
    }

    /// Refresh the record now.
    pub async fn heartbeat(&self) -> Result<(), serde_json::Error> {
        self.write_record(InstanceStatus::Active).await
    }

    /// Register and keep the record alive on `heartbeat_interval` until
    /// [`stop_heartbeat`](Self::stop_heartbeat) or
    /// [`deregister`](Self::deregister). Calling it again while running is a
    /// no-op.
    pub async fn start_heartbeat(&self) -> Result<(), serde_json::Error> {
        if self.heartbeat_slot().is_some() {
            return Ok(());
        }
        self.register().await?;

        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(this.inner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately and the record was just written
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(instance_id = %this.inner.instance_id, "heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = this.heartbeat().await {
                            tracing::warn!(error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        *self.heartbeat_slot() = Some(Heartbeat { cancel, task });
        tracing::debug!(
            interval_s = self.inner.config.heartbeat_interval.as_secs(),
            "heartbeat started"
        );
        Ok(())
    }

    pub async fn stop_heartbeat(&self) {
        let heartbeat = self.heartbeat_slot().take();
        if let Some(Heartbeat { cancel, task }) = heartbeat {
            cancel.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "heartbeat task ended abnormally");
            }
        }
    }

    /// Stop heartbeating and remove this instance's record right away
    /// instead of waiting for its TTL.
    pub async fn deregister(&self) {
        self.stop_heartbeat().await;
        self.store()
            .delete(&instance_key(&self.inner.instance_id))
            .await;
        tracing::info!(instance_id = %self.inner.instance_id, "instance deregistered");
    }

    /// Every instance whose record has not expired, sorted by id.
    pub async fn get_active_instances(&self) -> Vec<InstanceRecord> {
        let mut instances = Vec::new();
        for key in self.store().keys(INSTANCE_PREFIX).await {
            let Some(raw) = self.store().get(&key).await else {
                // Expired between the scan and the read
                continue;
            };
            match serde_json::from_str::<InstanceRecord>(&raw) {
                Ok(record) => instances.push(record),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping corrupt instance record"),
            }
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }
}
