use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AppResult;
use crate::shutdown::ShutdownSignal;
use crate::store::models::{PaymentStatus, SubmissionTransaction, TransactionStatus};
use crate::store::{PaymentStore, TransactionStore};
use crate::submitter::{Outcome, ProcessingLimiter, SubmitterEngine};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub claim_interval: Duration,
    pub lease: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_size: config.worker_pool_size,
            claim_interval: config.claim_interval(),
            lease: Duration::from_secs(config.lease_secs),
        }
    }
}

/// What the payment record says about a claimed row.
enum Gate {
    Proceed,
    Skipped,
}

/// Runs `pool_size` claim -> submit loops against the shared queue.
pub struct WorkerPool {
    store: Arc<dyn TransactionStore>,
    payments: Arc<dyn PaymentStore>,
    engine: Arc<SubmitterEngine>,
    limiter: Arc<ProcessingLimiter>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        payments: Arc<dyn PaymentStore>,
        engine: Arc<SubmitterEngine>,
        limiter: Arc<ProcessingLimiter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            payments,
            engine,
            limiter,
            settings,
        }
    }

    pub fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.settings.pool_size,
            interval_secs = self.settings.claim_interval.as_secs(),
            "👷 starting submission workers"
        );
        (0..self.settings.pool_size.max(1))
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, shutdown: ShutdownSignal) {
        while !shutdown.is_triggered() {
            let full_batch = match self.run_cycle(&shutdown).await {
                Ok((claimed, limit)) => claimed > 0 && claimed >= limit,
                Err(e) => {
                    error!(worker, "❌ claim cycle failed: {}", e);
                    false
                }
            };
            // a full batch means more rows are likely waiting
            if !full_batch && !shutdown.sleep(self.settings.claim_interval).await {
                break;
            }
        }
        info!(worker, "worker stopped");
    }

    /// One claim and the processing of everything claimed.
    /// Returns how many rows were claimed and the limit used.
    pub async fn run_cycle(&self, shutdown: &ShutdownSignal) -> AppResult<(usize, usize)> {
        let limit = self.limiter.limit();
        let batch = self.store.claim_batch(limit as i64, self.settings.lease).await?;
        if batch.is_empty() {
            return Ok((0, limit));
        }
        debug!(claimed = batch.len(), limit, "claimed submission batch");

        let results = join_all(batch.iter().map(|tx| self.handle(tx, shutdown))).await;

        let mut indeterminate = 0;
        for (tx, result) in batch.iter().zip(results) {
            match result {
                Ok(Some(outcome)) if outcome.is_indeterminate() => indeterminate += 1,
                Ok(_) => {}
                Err(e) => error!(tx_id = %tx.id, "failed to record outcome, lease will expire: {}", e),
            }
        }
        self.limiter.record_batch(batch.len(), indeterminate);
        Ok((batch.len(), limit))
    }

    async fn handle(&self, tx: &SubmissionTransaction, shutdown: &ShutdownSignal) -> AppResult<Option<Outcome>> {
        match self.gate(tx).await? {
            Gate::Proceed => self.engine.process(tx, shutdown).await.map(Some),
            Gate::Skipped => Ok(None),
        }
    }

    /// Moves the payment to Pending, or explains why the row cannot be sent now.
    async fn gate(&self, tx: &SubmissionTransaction) -> AppResult<Gate> {
        let payment = match self.payments.get(tx.external_id).await {
            Ok(payment) => payment,
            Err(e) if e.is_not_found() => {
                warn!(tx_id = %tx.id, payment_id = %tx.external_id, "payment not found, abandoning submission");
                self.store
                    .update_status(tx.id, TransactionStatus::Error, None, Some("payment not found".into()))
                    .await?;
                return Ok(Gate::Skipped);
            }
            Err(e) => return Err(e),
        };

        match payment.status {
            PaymentStatus::Ready => {
                self.payments
                    .transition(
                        payment.id,
                        PaymentStatus::Pending,
                        Some(format!("submission transaction {} claimed", tx.id)),
                        None,
                    )
                    .await?;
                Ok(Gate::Proceed)
            }
            PaymentStatus::Pending => Ok(Gate::Proceed),
            PaymentStatus::Draft | PaymentStatus::Paused => {
                let retry_after = Utc::now()
                    + chrono::Duration::from_std(self.settings.claim_interval)
                        .unwrap_or_else(|_| chrono::Duration::seconds(6));
                self.store
                    .unclaim(tx.id, Some(retry_after), Some(format!("payment is {}", payment.status)))
                    .await?;
                debug!(tx_id = %tx.id, status = %payment.status, "payment not ready, row returned");
                Ok(Gate::Skipped)
            }
            status => {
                warn!(tx_id = %tx.id, %status, "payment already settled, abandoning submission");
                self.store
                    .update_status(
                        tx.id,
                        TransactionStatus::Error,
                        None,
                        Some(format!("payment is {}, submission abandoned", status)),
                    )
                    .await?;
                Ok(Gate::Skipped)
            }
        }
    }
}
