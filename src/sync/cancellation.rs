use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::AppResult;
use crate::shutdown::ShutdownSignal;
use crate::store::PaymentStore;

/// Cancels payments left in Ready for longer than the inactivity period.
pub struct ReadyPaymentCanceller {
    payments: Arc<dyn PaymentStore>,
    period_days: i64,
}

impl ReadyPaymentCanceller {
    pub fn new(payments: Arc<dyn PaymentStore>, period_days: i64) -> Self {
        Self { payments, period_days }
    }

    fn message(&self) -> String {
        format!(
            "Payment canceled automatically after {} days in READY without being processed",
            self.period_days
        )
    }

    /// Cancels everything whose latest Ready entry is older than the period, measured from `now`.
    pub async fn cancel_stale(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let cutoff = now - ChronoDuration::days(self.period_days);
        let canceled = self.payments.cancel_stale_ready(cutoff, &self.message()).await?;
        if canceled.is_empty() {
            debug!("no payments were canceled");
        } else {
            info!(count = canceled.len(), period_days = self.period_days, "🗑️ stale ready payments canceled");
        }
        Ok(canceled)
    }

    pub fn start(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_days = self.period_days, "🗑️ ready payment cancel sweep started");
            loop {
                if let Err(e) = self.cancel_stale(Utc::now()).await {
                    error!("❌ cancel sweep failed: {}", e);
                }
                if !shutdown.sleep(interval).await {
                    break;
                }
            }
            info!("cancel sweep stopped");
        })
    }
}
