//! Delivery of settlement events to the read model.
//!
//! Settlement writes one `read_model_outbox` row per affected user inside
//! its own transaction. [`ReadModelOutbox::publish_pending`] drains those
//! rows to an [`AggregateSink`]. A failed delivery stays queued with its
//! error and attempt count until `max_attempts` is reached.

use crate::error::{Result, RoomError};
use crate::storage::{OutboxStore, Storage};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait AggregateSink: Send + Sync {
    /// Recompute profile stats and leaderboard rows for one user.
    async fn recompute_aggregates(&self, user_id: &str, room_id: &str) -> Result<()>;
}

/// Sink that only logs; used when no read model is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingAggregateSink;

#[async_trait]
impl AggregateSink for LoggingAggregateSink {
    async fn recompute_aggregates(&self, user_id: &str, room_id: &str) -> Result<()> {
        tracing::info!("Aggregates stale for {} after room {}", user_id, room_id);
        Ok(())
    }
}

#[derive(Serialize)]
struct RecomputeRequest<'a> {
    user_id: &'a str,
    room_id: &'a str,
}

/// Posts `{user_id, room_id}` to `{base_url}/aggregates/recompute`.
#[derive(Debug, Clone)]
pub struct HttpAggregateSink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAggregateSink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RoomError::config(format!("Failed to build read model client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AggregateSink for HttpAggregateSink {
    async fn recompute_aggregates(&self, user_id: &str, room_id: &str) -> Result<()> {
        let url = format!("{}/aggregates/recompute", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&RecomputeRequest { user_id, room_id })
            .send()
            .await
            .map_err(|e| RoomError::internal(format!("read model unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(RoomError::internal(format!(
                "read model answered {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct ReadModelOutbox {
    storage: Arc<Storage>,
    sink: Arc<dyn AggregateSink>,
    batch: usize,
    max_attempts: u32,
}

impl ReadModelOutbox {
    pub fn new(
        storage: Arc<Storage>,
        sink: Arc<dyn AggregateSink>,
        batch: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            storage,
            sink,
            batch,
            max_attempts,
        }
    }

    /// Deliver one batch of queued recompute requests.
    pub async fn publish_pending(&self) -> Result<PublishReport> {
        let store = OutboxStore::new(&self.storage);
        let entries = store.fetch_pending(self.batch, self.max_attempts).await?;
        let mut report = PublishReport::default();

        for entry in entries {
            match self
                .sink
                .recompute_aggregates(&entry.user_id, &entry.room_id)
                .await
            {
                Ok(()) => {
                    store.mark_delivered(entry.id, Utc::now()).await?;
                    report.delivered += 1;
                }
                Err(e) => {
                    let attempt = entry.attempts + 1;
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            "Giving up on aggregates for {} (room {}) after {} attempts: {}",
                            entry.user_id,
                            entry.room_id,
                            attempt,
                            e
                        );
                    } else {
                        tracing::warn!(
                            "Aggregate recompute for {} failed (attempt {}): {}",
                            entry.user_id,
                            attempt,
                            e
                        );
                    }
                    store.mark_failed(entry.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        if report.delivered + report.failed > 0 {
            tracing::debug!(
                "Read model outbox: {} delivered, {} failed",
                report.delivered,
                report.failed
            );
        }
        Ok(report)
    }

    pub async fn pending(&self) -> Result<u64> {
        OutboxStore::new(&self.storage).pending_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{outbox_store, temp_storage};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FlakySink {
        failures_left: Mutex<u32>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AggregateSink for FlakySink {
        async fn recompute_aggregates(&self, user_id: &str, _room_id: &str) -> Result<()> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(RoomError::internal("read model down"));
            }
            self.seen.lock().push(user_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let (_dir, storage) = temp_storage().await;
        {
            let conn = storage.get_connection().await;
            outbox_store::enqueue(&conn, "alice", "room-1", Utc::now()).unwrap();
            outbox_store::enqueue(&conn, "bob", "room-1", Utc::now()).unwrap();
        }

        let sink = Arc::new(FlakySink {
            failures_left: Mutex::new(1),
            ..Default::default()
        });
        let outbox = ReadModelOutbox::new(storage.clone(), sink.clone(), 10, 5);

        let first = outbox.publish_pending().await.unwrap();
        assert_eq!(first, PublishReport { delivered: 1, failed: 1 });
        assert_eq!(outbox.pending().await.unwrap(), 1);

        let second = outbox.publish_pending().await.unwrap();
        assert_eq!(second, PublishReport { delivered: 1, failed: 0 });
        assert_eq!(outbox.pending().await.unwrap(), 0);

        let mut seen = sink.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_rows_are_parked() {
        let (_dir, storage) = temp_storage().await;
        {
            let conn = storage.get_connection().await;
            outbox_store::enqueue(&conn, "alice", "room-1", Utc::now()).unwrap();
        }

        let sink = Arc::new(FlakySink {
            failures_left: Mutex::new(10),
            ..Default::default()
        });
        let outbox = ReadModelOutbox::new(storage, sink, 10, 2);

        assert_eq!(outbox.publish_pending().await.unwrap().failed, 1);
        assert_eq!(outbox.publish_pending().await.unwrap().failed, 1);
        // Two attempts used up; the row is no longer fetched
        assert_eq!(outbox.publish_pending().await.unwrap(), PublishReport::default());
        assert_eq!(outbox.pending().await.unwrap(), 1);
    }
}
