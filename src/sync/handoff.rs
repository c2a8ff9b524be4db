use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events::{Message, PaymentReadyData, PAYMENT_READY_TOPIC};
use crate::shutdown::ShutdownSignal;
use crate::signing::resolver::DistributionAccountResolver;
use crate::store::models::{NewSubmissionTransaction, PaymentStatus};
use crate::store::{PaymentStore, TransactionStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    pub queued: Vec<Uuid>,
    pub skipped: usize,
}

/// Queues submission rows for Ready payments.
pub struct PaymentToSubmitter {
    payments: Arc<dyn PaymentStore>,
    store: Arc<dyn TransactionStore>,
    resolver: Arc<DistributionAccountResolver>,
    batch_size: usize,
}

impl PaymentToSubmitter {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        store: Arc<dyn TransactionStore>,
        resolver: Arc<DistributionAccountResolver>,
        batch_size: usize,
    ) -> Self {
        Self {
            payments,
            store,
            resolver,
            batch_size: batch_size.max(1),
        }
    }

    #[instrument(skip(self, payment_ids), fields(tenant_id = %tenant_id, count = payment_ids.len()))]
    pub async fn send_ready_payments(&self, tenant_id: &str, payment_ids: &[Uuid]) -> AppResult<HandoffReport> {
        let mut report = HandoffReport::default();

        for id in payment_ids {
            let payment = match self.payments.get(*id).await {
                Ok(payment) => payment,
                Err(e) if e.is_not_found() => {
                    warn!(payment_id = %id, "ready payment not found");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if payment.tenant_id != tenant_id {
                warn!(payment_id = %id, owner = %payment.tenant_id, "payment belongs to another tenant");
                report.skipped += 1;
                continue;
            }
            if payment.status != PaymentStatus::Ready {
                debug!(payment_id = %id, status = %payment.status, "payment not ready");
                report.skipped += 1;
                continue;
            }
            // an unsynced row is either in flight or waiting to be written back
            if let Some(existing) = self.store.find_unsynced_for_payment(payment.id).await? {
                debug!(payment_id = %id, tx_id = %existing.id, status = %existing.status, "payment already queued");
                report.skipped += 1;
                continue;
            }

            let account = self.resolver.resolve(tenant_id);
            let row = self
                .store
                .insert(NewSubmissionTransaction::for_payment(&payment, account))
                .await?;
            debug!(payment_id = %id, tx_id = %row.id, account = %row.distribution_account, "submission queued");
            report.queued.push(payment.id);
        }

        if !report.queued.is_empty() {
            info!(queued = report.queued.len(), skipped = report.skipped, "📤 ready payments handed to submitter");
        }
        Ok(report)
    }

    /// Handles a `payment_ready` event.
    pub async fn handle_event(&self, message: &Message) -> AppResult<HandoffReport> {
        if message.topic != PAYMENT_READY_TOPIC {
            return Err(AppError::InvalidInput(format!("unexpected topic {}", message.topic)));
        }
        let data: PaymentReadyData = message.data_as()?;
        self.send_ready_payments(&message.tenant_id, &data.payment_ids).await
    }

    /// One sweep over a tenant's Ready payments.
    pub async fn sweep(&self, tenant_id: &str) -> AppResult<HandoffReport> {
        let ready = self
            .payments
            .list_by_status(tenant_id, PaymentStatus::Ready, self.batch_size as i64)
            .await?;
        if ready.is_empty() {
            return Ok(HandoffReport::default());
        }
        let ids: Vec<Uuid> = ready.iter().map(|p| p.id).collect();
        self.send_ready_payments(tenant_id, &ids).await
    }

    /// Polls for Ready payments whose event was lost.
    pub fn start(self: Arc<Self>, tenants: Vec<String>, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(tenants = tenants.len(), "📤 payment handoff sweep started");
            loop {
                for tenant in &tenants {
                    if let Err(e) = self.sweep(tenant).await {
                        error!(tenant_id = %tenant, "❌ payment handoff sweep failed: {}", e);
                    }
                }
                if !shutdown.sleep(interval).await {
                    break;
                }
            }
            info!("payment handoff sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryPaymentStore, MemoryTssStore};
    use crate::store::models::{MemoType, Payment, SigningBackend, TransactionStatus};

    struct Harness {
        handoff: PaymentToSubmitter,
        store: Arc<MemoryTssStore>,
        payments: Arc<MemoryPaymentStore>,
    }

    fn harness(backend: SigningBackend) -> Harness {
        let store = Arc::new(MemoryTssStore::new());
        let payments = Arc::new(MemoryPaymentStore::new());
        let resolver = Arc::new(DistributionAccountResolver::fixed(backend, "GDIST"));
        Harness {
            handoff: PaymentToSubmitter::new(payments.clone(), store.clone(), resolver, 10),
            store,
            payments,
        }
    }

    async fn ready_payment(payments: &MemoryPaymentStore) -> Payment {
        let mut payment = Payment::draft("tenant", "12.5", "USDC", Some("GISSUER".into()), "GDEST");
        payment.memo = Some("invoice-7".into());
        payment.memo_type = Some(MemoType::Text);
        payment.transition(PaymentStatus::Ready, None).unwrap();
        payments.insert(payment).await.unwrap()
    }

    #[tokio::test]
    async fn test_queues_row_with_payment_details() {
        let h = harness(SigningBackend::Env);
        let payment = ready_payment(&h.payments).await;

        let report = h.handoff.send_ready_payments("tenant", &[payment.id]).await.unwrap();
        assert_eq!(report.queued, vec![payment.id]);

        let row = h.store.find_unsynced_for_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert_eq!(row.distribution_account, "GDIST");
        assert_eq!(row.amount, "12.5");
        assert_eq!(row.asset_issuer.as_deref(), Some("GISSUER"));
        assert_eq!(row.memo.as_deref(), Some("invoice-7"));
        assert_eq!(row.tenant_id, "tenant");
    }

    #[tokio::test]
    async fn test_second_delivery_does_not_duplicate() {
        let h = harness(SigningBackend::Env);
        let payment = ready_payment(&h.payments).await;
        let message = Message::payment_ready("tenant", vec![payment.id]).unwrap();

        h.handoff.handle_event(&message).await.unwrap();
        let report = h.handoff.handle_event(&message).await.unwrap();
        assert!(report.queued.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_skips_non_ready_and_foreign_payments() {
        let h = harness(SigningBackend::Env);
        let draft = h
            .payments
            .insert(Payment::draft("tenant", "1", "XLM", None, "GDEST"))
            .await
            .unwrap();
        let mut foreign = Payment::draft("other", "1", "XLM", None, "GDEST");
        foreign.transition(PaymentStatus::Ready, None).unwrap();
        let foreign = h.payments.insert(foreign).await.unwrap();

        let report = h
            .handoff
            .send_ready_payments("tenant", &[draft.id, foreign.id, Uuid::new_v4()])
            .await
            .unwrap();
        assert!(report.queued.is_empty());
        assert_eq!(report.skipped, 3);
    }

    #[tokio::test]
    async fn test_pool_rows_stay_on_distribution_account() {
        let h = harness(SigningBackend::Pool);
        let first = ready_payment(&h.payments).await;
        let second = ready_payment(&h.payments).await;

        let report = h.handoff.sweep("tenant").await.unwrap();
        assert_eq!(report.queued.len(), 2);

        for payment in [first, second] {
            let row = h.store.find_unsynced_for_payment(payment.id).await.unwrap().unwrap();
            assert_eq!(row.distribution_account, "GDIST");
            assert_eq!(row.channel_account, None);
        }
    }
}
