use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::events::{Message, PaymentCompletedData, PAYMENT_COMPLETED_TOPIC};
use crate::shutdown::ShutdownSignal;
use crate::store::models::{PaymentStatus, SubmissionTransaction, TransactionStatus};
use crate::store::{PaymentStore, TransactionStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Rows marked synced in this pass.
    pub synced: usize,
    /// Payment writes performed. Less than `synced` when a payment already held the outcome.
    pub written: usize,
    /// Rows left unsynced for a later pass.
    pub deferred: usize,
}

/// What applying one terminal row did to its payment.
#[derive(Debug, PartialEq, Eq)]
enum Applied {
    Written,
    AlreadyApplied,
    Deferred,
}

/// Writes terminal submission outcomes back to their payments, then marks the rows synced.
///
/// The payment write always comes first. A crash between the two writes leaves the
/// row unsynced, and the next pass finds the payment already in its target state.
pub struct CompletionSync {
    store: Arc<dyn TransactionStore>,
    payments: Arc<dyn PaymentStore>,
    batch_size: usize,
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CompletionSync {
    pub fn new(store: Arc<dyn TransactionStore>, payments: Arc<dyn PaymentStore>, batch_size: usize) -> Self {
        Self {
            store,
            payments,
            batch_size: batch_size.max(1),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One polling pass for a tenant. Returns an empty report if another pass
    /// for the same tenant is already running.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn sync_tenant(&self, tenant_id: &str) -> AppResult<SyncReport> {
        let _guard: OwnedMutexGuard<()> = match self.tenant_lock(tenant_id).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("sync pass already running for tenant");
                return Ok(SyncReport::default());
            }
        };

        let rows = self
            .store
            .get_unsynced_terminal(tenant_id, self.batch_size as i64)
            .await?;
        self.apply_batch(rows).await
    }

    /// Handles a completion event. Waits for any running pass of the same tenant.
    pub async fn handle_event(&self, message: &Message) -> AppResult<SyncReport> {
        if message.topic != PAYMENT_COMPLETED_TOPIC {
            debug!(topic = %message.topic, "ignoring event for another topic");
            return Ok(SyncReport::default());
        }
        let data: PaymentCompletedData = message.data_as()?;

        let lock = self.tenant_lock(&message.tenant_id);
        let _guard = lock.lock().await;

        let row = self.store.get(data.transaction_id).await?;
        if row.synced_at.is_some() {
            debug!(tx_id = %row.id, "transaction already synced, event redelivered");
            return Ok(SyncReport::default());
        }
        if !row.status.is_terminal() {
            warn!(tx_id = %row.id, status = %row.status, "completion event for a non-terminal row");
            return Ok(SyncReport::default());
        }
        self.apply_batch(vec![row]).await
    }

    async fn apply_batch(&self, rows: Vec<SubmissionTransaction>) -> AppResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut done: Vec<Uuid> = Vec::with_capacity(rows.len());

        for row in &rows {
            match self.apply(row).await {
                Ok(Applied::Written) => {
                    report.written += 1;
                    done.push(row.id);
                }
                Ok(Applied::AlreadyApplied) => done.push(row.id),
                Ok(Applied::Deferred) => report.deferred += 1,
                Err(e) => {
                    warn!(tx_id = %row.id, payment_id = %row.external_id, "payment write failed, row stays unsynced: {}", e);
                    report.deferred += 1;
                }
            }
        }

        if !done.is_empty() {
            self.store.mark_synced(&done).await?;
            report.synced = done.len();
            info!(synced = report.synced, written = report.written, "🔄 completion sync pass");
        }
        Ok(report)
    }

    async fn apply(&self, row: &SubmissionTransaction) -> AppResult<Applied> {
        let payment = match self.payments.get(row.external_id).await {
            Ok(payment) => payment,
            Err(e) if e.is_not_found() => {
                warn!(tx_id = %row.id, payment_id = %row.external_id, "payment no longer exists, nothing to update");
                return Ok(Applied::AlreadyApplied);
            }
            Err(e) => return Err(e),
        };

        let target = match row.status {
            TransactionStatus::Success => PaymentStatus::Success,
            TransactionStatus::Error => PaymentStatus::Failed,
            _ => return Ok(Applied::Deferred),
        };

        match (target, payment.status) {
            (_, PaymentStatus::Pending) => {
                self.payments
                    .transition(
                        payment.id,
                        target,
                        row.status_message.clone(),
                        row.network_tx_hash.clone(),
                    )
                    .await?;
                debug!(tx_id = %row.id, payment_id = %payment.id, status = %target, "payment updated");
                Ok(Applied::Written)
            }
            (target, current) if target == current => Ok(Applied::AlreadyApplied),
            // an abandoned or superseded attempt; the payment has moved on
            (PaymentStatus::Failed, _) => Ok(Applied::AlreadyApplied),
            (_, current) => {
                error!(
                    tx_id = %row.id,
                    payment_id = %payment.id,
                    payment_status = %current,
                    hash = ?row.network_tx_hash,
                    "❌ confirmed transaction for a payment that is not pending, needs operator review"
                );
                Ok(Applied::Deferred)
            }
        }
    }

    /// Polling sweep over the given tenants so lost events are still reconciled.
    pub fn start(self: Arc<Self>, tenants: Vec<String>, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(tenants = tenants.len(), interval_secs = interval.as_secs(), "🔄 completion sync started");
            loop {
                let passes = tenants.iter().map(|tenant| {
                    let sync = self.clone();
                    async move {
                        if let Err(e) = sync.sync_tenant(tenant).await {
                            error!(tenant_id = %tenant, "❌ completion sync failed: {}", e);
                        }
                    }
                });
                futures::future::join_all(passes).await;

                if !shutdown.sleep(interval).await {
                    break;
                }
            }
            info!("completion sync stopped");
        })
    }

    /// Consumes completion events from the in-process channel.
    pub fn consume(self: Arc<Self>, mut receiver: mpsc::Receiver<Message>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                if let Err(e) = self.handle_event(&message).await {
                    // the polling sweep picks the row up later
                    warn!(key = %message.key, "completion event not applied: {}", e);
                }
            }
            info!("completion event consumer stopped");
        })
    }
}
