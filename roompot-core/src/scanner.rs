//! Background sweep that starts due rooms and settles expired ones.
//!
//! The scanner is just another caller of [`RoomManager`]; it relies on the
//! same idempotency keys and conditional terminal write as manual calls, so
//! it may overlap with an operator completing the same room.

use crate::error::Result;
use crate::room::RoomManager;
use crate::settlement::SettlementOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub started: usize,
    pub settled: usize,
    pub already_settled: usize,
    pub pending: usize,
    pub failed: usize,
    pub published: usize,
}

pub struct ExpiryScanner {
    manager: Arc<RoomManager>,
    interval: Duration,
}

impl ExpiryScanner {
    pub fn new(manager: Arc<RoomManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// One sweep. A room that fails to settle is logged and skipped.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let mut report = ScanReport {
            started: self.manager.start_due_rooms(now).await?.len(),
            ..Default::default()
        };

        let expired = self.manager.expired_rooms(now).await?;
        if !expired.is_empty() {
            tracing::info!("Scanner found {} expired rooms", expired.len());
        }

        for room in expired {
            match self.manager.complete_room(&room.id, None).await {
                Ok(SettlementOutcome::Settled(decision)) => {
                    tracing::info!(
                        "Scanner settled room {}: {} winners, fee {}",
                        room.id,
                        decision.payouts.len(),
                        decision.platform_fee
                    );
                    report.settled += 1;
                }
                Ok(SettlementOutcome::AlreadySettled) => report.already_settled += 1,
                Ok(SettlementOutcome::Pending { reason }) => {
                    tracing::warn!("Room {} left pending: {}", room.id, reason);
                    report.pending += 1;
                }
                Err(e) => {
                    tracing::error!("Scanner could not settle room {}: {}", room.id, e);
                    report.failed += 1;
                }
            }
        }

        // Deliveries from earlier failures are retried on every sweep
        match self.manager.outbox().publish_pending().await {
            Ok(published) => report.published = published.delivered,
            Err(e) => tracing::warn!("Read model publish failed: {}", e),
        }

        Ok(report)
    }

    /// Run sweeps on an interval until `shutdown` fires or its sender is dropped.
    pub fn spawn(self, mut shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        tracing::info!("Expiry scanner stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.scan_once(Utc::now()).await {
                            Ok(report) => tracing::debug!("Scan finished: {:?}", report),
                            Err(e) => tracing::warn!("Scan iteration failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
