use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppResult, StateError, StoreError};
use crate::store::models::{
    AccountState, DistributionAccount, NewSubmissionTransaction, Payment, PaymentStatus,
    SigningBackend, SubmissionAttempt, SubmissionTransaction, TransactionStatus,
};
use crate::store::{DistributionAccountStore, PaymentStore, TransactionStore};

#[derive(Default)]
struct TssState {
    transactions: HashMap<Uuid, SubmissionTransaction>,
    accounts: HashMap<String, (DistributionAccount, Option<String>)>,
}

/// In-memory TSS database: submission rows plus distribution accounts.
///
/// One write lock guards claims, which gives the same exclusivity as a
/// skip-locked row selection.
#[derive(Default)]
pub struct MemoryTssStore {
    state: RwLock<TssState>,
}

impl MemoryTssStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::NotFound(format!("{} {}", what, id))
}

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

#[async_trait]
impl TransactionStore for MemoryTssStore {
    async fn insert(&self, new: NewSubmissionTransaction) -> AppResult<SubmissionTransaction> {
        let tx = new.into_transaction();
        self.state.write().await.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn get(&self, id: Uuid) -> AppResult<SubmissionTransaction> {
        let state = self.state.read().await;
        state
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("submission transaction", id).into())
    }

    async fn find_unsynced_for_payment(&self, payment_id: Uuid) -> AppResult<Option<SubmissionTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .filter(|tx| tx.external_id == payment_id && tx.synced_at.is_none())
            .max_by_key(|tx| tx.created_at)
            .cloned())
    }

    async fn claim_batch(&self, limit: i64, lease: Duration) -> AppResult<Vec<SubmissionTransaction>> {
        if limit <= 0 {
            return Err(StoreError::InvalidArgument(format!("limit must be positive, got {}", limit)).into());
        }

        let now = Utc::now();
        let mut state = self.state.write().await;
        let TssState { transactions, accounts } = &mut *state;

        let mut candidates: Vec<&mut SubmissionTransaction> = transactions
            .values_mut()
            .filter(|tx| tx.is_claimable(now))
            .filter(|tx| {
                accounts
                    .get(&tx.distribution_account)
                    .map_or(false, |(acc, _)| acc.state == AccountState::Active)
            })
            .collect();
        candidates.sort_by_key(|tx| tx.created_at);

        let mut claimed = Vec::new();
        for tx in candidates.into_iter().take(limit as usize) {
            if tx.status == TransactionStatus::Processing {
                // lease expired; hand it back to the queue first
                tx.transition(TransactionStatus::Pending, None, Some("lease expired".into()))?;
            }
            tx.transition(TransactionStatus::Processing, None, None)?;
            tx.locked_until = Some(lease_expiry(now, lease));
            claimed.push(tx.clone());
        }
        Ok(claimed)
    }

    async fn save_attempt(&self, id: Uuid, attempt: SubmissionAttempt) -> AppResult<()> {
        let mut state = self.state.write().await;
        let tx = state.transactions.get_mut(&id).ok_or_else(|| not_found("submission transaction", id))?;
        tx.network_tx_hash = Some(attempt.hash);
        if !attempt.fee_bump {
            // a fee-bump keeps the inner envelope
            tx.envelope_xdr = Some(attempt.envelope_xdr);
            tx.channel_account = attempt.channel_account;
        }
        tx.sequence_number = Some(attempt.sequence_number);
        tx.min_ledger = Some(attempt.window.min_ledger);
        tx.max_ledger = Some(attempt.window.max_ledger);
        if attempt.fee_bump {
            tx.fee_bump_attempts += 1;
            tx.needs_fee_bump = false;
        }
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_attempt(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let tx = state.transactions.get_mut(&id).ok_or_else(|| not_found("submission transaction", id))?;
        tx.network_tx_hash = None;
        tx.envelope_xdr = None;
        tx.channel_account = None;
        tx.sequence_number = None;
        tx.min_ledger = None;
        tx.max_ledger = None;
        tx.needs_fee_bump = false;
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn request_fee_bump(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let tx = state.transactions.get_mut(&id).ok_or_else(|| not_found("submission transaction", id))?;
        tx.needs_fee_bump = true;
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        hash: Option<String>,
        message: Option<String>,
    ) -> AppResult<SubmissionTransaction> {
        let mut state = self.state.write().await;
        let tx = state.transactions.get_mut(&id).ok_or_else(|| not_found("submission transaction", id))?;
        tx.transition(status, hash, message)?;
        Ok(tx.clone())
    }

    async fn unclaim(&self, id: Uuid, retry_after: Option<DateTime<Utc>>, message: Option<String>) -> AppResult<()> {
        let mut state = self.state.write().await;
        let tx = state.transactions.get_mut(&id).ok_or_else(|| not_found("submission transaction", id))?;
        tx.transition(TransactionStatus::Pending, None, message)?;
        tx.retry_after = retry_after;
        Ok(())
    }

    async fn park(&self, id: Uuid, reason: String) -> AppResult<()> {
        let mut state = self.state.write().await;
        let tx = state.transactions.get_mut(&id).ok_or_else(|| not_found("submission transaction", id))?;
        if tx.status != TransactionStatus::Processing {
            return Err(StateError::InvalidTransition {
                from: tx.status.to_string(),
                to: "parked".into(),
            }
            .into());
        }
        tx.locked_until = None;
        tx.status_message = Some(reason);
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn release(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let tx = state.transactions.get_mut(&id).ok_or_else(|| not_found("submission transaction", id))?;
        tx.transition(TransactionStatus::Pending, None, Some("released by operator".into()))?;
        tx.retry_after = None;
        Ok(())
    }

    async fn get_unsynced_terminal(&self, tenant_id: &str, limit: i64) -> AppResult<Vec<SubmissionTransaction>> {
        if limit <= 0 {
            return Err(StoreError::InvalidArgument(format!("limit must be positive, got {}", limit)).into());
        }
        let state = self.state.read().await;
        let mut rows: Vec<SubmissionTransaction> = state
            .transactions
            .values()
            .filter(|tx| tx.tenant_id == tenant_id && tx.status.is_terminal() && tx.synced_at.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|tx| tx.completed_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn mark_synced(&self, ids: &[Uuid]) -> AppResult<()> {
        if ids.is_empty() {
            return Err(StoreError::InvalidArgument("no transaction ids to mark synced".into()).into());
        }
        let mut state = self.state.write().await;
        let eligible = ids
            .iter()
            .filter(|id| {
                state
                    .transactions
                    .get(id)
                    .map_or(false, |tx| tx.status.is_terminal() && tx.synced_at.is_none())
            })
            .count();
        if eligible != ids.len() {
            return Err(StateError::SyncMismatch {
                expected: ids.len(),
                updated: eligible,
            }
            .into());
        }

        let now = Utc::now();
        for id in ids {
            if let Some(tx) = state.transactions.get_mut(id) {
                tx.synced_at = Some(now);
                tx.updated_at = now;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DistributionAccountStore for MemoryTssStore {
    async fn upsert(&self, account: DistributionAccount, encrypted_secret: Option<String>) -> AppResult<()> {
        let mut state = self.state.write().await;
        state
            .accounts
            .insert(account.public_key.clone(), (account, encrypted_secret));
        Ok(())
    }

    async fn get_account(&self, public_key: &str) -> AppResult<DistributionAccount> {
        let state = self.state.read().await;
        state
            .accounts
            .get(public_key)
            .map(|(acc, _)| acc.clone())
            .ok_or_else(|| not_found("distribution account", public_key).into())
    }

    async fn list_accounts(
        &self,
        backend: Option<SigningBackend>,
        account_state: Option<AccountState>,
    ) -> AppResult<Vec<DistributionAccount>> {
        let state = self.state.read().await;
        let mut accounts: Vec<DistributionAccount> = state
            .accounts
            .values()
            .map(|(acc, _)| acc)
            .filter(|acc| backend.map_or(true, |b| acc.backend == b))
            .filter(|acc| account_state.map_or(true, |s| acc.state == s))
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.public_key.cmp(&b.public_key)));
        Ok(accounts)
    }

    async fn set_state(&self, public_key: &str, account_state: AccountState) -> AppResult<()> {
        let mut state = self.state.write().await;
        let (acc, secret) = state
            .accounts
            .get_mut(public_key)
            .ok_or_else(|| not_found("distribution account", public_key))?;
        acc.state = account_state;
        acc.updated_at = Utc::now();
        if account_state == AccountState::Retired {
            *secret = None;
        }
        Ok(())
    }

    async fn lock_idle_channel(&self, current_ledger: u32, until_ledger: u32) -> AppResult<Option<String>> {
        let mut state = self.state.write().await;
        let idle = state
            .accounts
            .values_mut()
            .map(|(acc, _)| acc)
            .filter(|acc| acc.backend == SigningBackend::Pool && acc.state == AccountState::Active)
            .filter(|acc| acc.is_idle_at(current_ledger))
            .min_by(|a, b| {
                a.locked_until_ledger
                    .cmp(&b.locked_until_ledger)
                    .then_with(|| a.public_key.cmp(&b.public_key))
            });
        Ok(idle.map(|acc| {
            acc.locked_until_ledger = Some(until_ledger);
            acc.updated_at = Utc::now();
            acc.public_key.clone()
        }))
    }

    async fn lock_account(&self, public_key: &str, current_ledger: u32, until_ledger: u32) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let (acc, _) = state
            .accounts
            .get_mut(public_key)
            .ok_or_else(|| not_found("distribution account", public_key))?;
        if !acc.is_idle_at(current_ledger) {
            return Ok(false);
        }
        acc.locked_until_ledger = Some(until_ledger);
        acc.updated_at = Utc::now();
        Ok(true)
    }

    async fn unlock_account(&self, public_key: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        let (acc, _) = state
            .accounts
            .get_mut(public_key)
            .ok_or_else(|| not_found("distribution account", public_key))?;
        acc.locked_until_ledger = None;
        acc.updated_at = Utc::now();
        Ok(())
    }

    async fn load_secret(&self, public_key: &str) -> AppResult<Option<String>> {
        let state = self.state.read().await;
        state
            .accounts
            .get(public_key)
            .map(|(_, secret)| secret.clone())
            .ok_or_else(|| not_found("distribution account", public_key).into())
    }

    async fn delete_account(&self, public_key: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        state
            .accounts
            .remove(public_key)
            .map(|_| ())
            .ok_or_else(|| not_found("distribution account", public_key).into())
    }
}

/// In-memory platform payment table.
#[derive(Default)]
pub struct MemoryPaymentStore {
    payments: RwLock<HashMap<Uuid, Payment>>,
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn insert(&self, payment: Payment) -> AppResult<Payment> {
        self.payments.write().await.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get(&self, id: Uuid) -> AppResult<Payment> {
        self.payments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("payment", id).into())
    }

    async fn list_by_status(&self, tenant_id: &str, status: PaymentStatus, limit: i64) -> AppResult<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut found: Vec<Payment> = payments
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        message: Option<String>,
        network_tx_id: Option<String>,
    ) -> AppResult<Payment> {
        let mut payments = self.payments.write().await;
        let payment = payments.get_mut(&id).ok_or_else(|| not_found("payment", id))?;
        payment.transition(to, message)?;
        if network_tx_id.is_some() {
            payment.network_tx_id = network_tx_id;
        }
        Ok(payment.clone())
    }

    async fn retry_failed(&self, id: Uuid, user_email: &str) -> AppResult<Payment> {
        let mut payments = self.payments.write().await;
        let payment = payments.get_mut(&id).ok_or_else(|| not_found("payment", id))?;
        payment.retry(user_email)?;
        Ok(payment.clone())
    }

    async fn cancel_stale_ready(&self, cutoff: DateTime<Utc>, message: &str) -> AppResult<Vec<Uuid>> {
        let mut payments = self.payments.write().await;
        let mut canceled = Vec::new();
        for payment in payments.values_mut() {
            if payment.status != PaymentStatus::Ready {
                continue;
            }
            let stale = payment
                .status_history
                .latest(PaymentStatus::Ready)
                .map_or(false, |entry| entry.timestamp <= cutoff);
            if stale {
                payment.transition(PaymentStatus::Canceled, Some(message.to_string()))?;
                canceled.push(payment.id);
            }
        }
        Ok(canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::history::StatusHistory;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn seeded_store(rows: usize) -> Arc<MemoryTssStore> {
        let store = Arc::new(MemoryTssStore::new());
        store
            .upsert(
                DistributionAccount::new("GDIST", SigningBackend::Env, AccountState::Active),
                None,
            )
            .await
            .unwrap();
        for _ in 0..rows {
            let payment = Payment::draft("t1", "1.0000000", "XLM", None, "GDEST");
            store
                .insert(NewSubmissionTransaction::for_payment(&payment, "GDIST"))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_claim_rejects_non_positive_limit() {
        let store = seeded_store(1).await;
        let err = store.claim_batch(0, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::AppError::Store(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let store = seeded_store(25).await;
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_batch(4, Duration::from_secs(30)).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for tx in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(tx.id), "row {} claimed twice", tx.id);
                assert_eq!(tx.status, TransactionStatus::Processing);
            }
        }
        // N * batch = 40 > M = 25
        assert_eq!(total, 25);
    }

    #[tokio::test]
    async fn test_claim_skips_inactive_accounts() {
        let store = seeded_store(2).await;
        store.set_state("GDIST", AccountState::Retired).await.unwrap();
        assert!(store.claim_batch(10, Duration::from_secs(30)).await.unwrap().is_empty());

        store.set_state("GDIST", AccountState::Active).await.unwrap();
        assert_eq!(store.claim_batch(10, Duration::from_secs(30)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retiring_account_drops_secret() {
        let store = MemoryTssStore::new();
        store
            .upsert(
                DistributionAccount::new("GCHAN", SigningBackend::Pool, AccountState::Active),
                Some("sealed".into()),
            )
            .await
            .unwrap();

        store.set_state("GCHAN", AccountState::Active).await.unwrap();
        assert_eq!(store.load_secret("GCHAN").await.unwrap().as_deref(), Some("sealed"));

        store.set_state("GCHAN", AccountState::Retired).await.unwrap();
        assert_eq!(store.load_secret("GCHAN").await.unwrap(), None);
        assert_eq!(store.get_account("GCHAN").await.unwrap().state, AccountState::Retired);
    }

    #[tokio::test]
    async fn test_idle_channel_locking() {
        let store = MemoryTssStore::new();
        for (pk, backend, state) in [
            ("GA", SigningBackend::Pool, AccountState::Active),
            ("GB", SigningBackend::Pool, AccountState::Active),
            ("GC", SigningBackend::Pool, AccountState::Retired),
            ("GD", SigningBackend::Env, AccountState::Active),
        ] {
            store.upsert(DistributionAccount::new(pk, backend, state), None).await.unwrap();
        }

        assert_eq!(store.lock_idle_channel(100, 110).await.unwrap().as_deref(), Some("GA"));
        assert_eq!(store.lock_idle_channel(100, 110).await.unwrap().as_deref(), Some("GB"));
        assert_eq!(store.lock_idle_channel(105, 115).await.unwrap(), None);
        assert!(!store.lock_account("GA", 110, u32::MAX).await.unwrap());

        // locks lapse once their ledger has passed
        assert_eq!(store.lock_idle_channel(111, 121).await.unwrap().as_deref(), Some("GA"));
        store.unlock_account("GB").await.unwrap();
        assert!(store.lock_account("GB", 111, u32::MAX).await.unwrap());
        assert!(store.unlock_account("GNONE").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unclaim_with_backoff_delays_reclaim() {
        let store = seeded_store(1).await;
        let claimed = store.claim_batch(1, Duration::from_secs(30)).await.unwrap();
        let id = claimed[0].id;

        store
            .unclaim(id, Some(Utc::now() + chrono::Duration::seconds(60)), Some("tx_bad_seq".into()))
            .await
            .unwrap();
        assert!(store.claim_batch(1, Duration::from_secs(30)).await.unwrap().is_empty());

        let row = store.get(id).await.unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert_eq!(row.status_message.as_deref(), Some("tx_bad_seq"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = seeded_store(1).await;
        let first = store.claim_batch(1, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = store.claim_batch(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_parked_row_stays_out_of_queue_until_released() {
        let store = seeded_store(1).await;
        let id = store.claim_batch(1, Duration::from_millis(10)).await.unwrap()[0].id;
        store.park(id, "not authorized".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.claim_batch(1, Duration::from_secs(30)).await.unwrap().is_empty());

        store.release(id).await.unwrap();
        assert_eq!(store.claim_batch(1, Duration::from_secs(30)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_missing_row() {
        let store = seeded_store(0).await;
        let err = store
            .update_status(Uuid::new_v4(), TransactionStatus::Error, None, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mark_synced_only_terminal_rows() {
        let store = seeded_store(2).await;
        let claimed = store.claim_batch(2, Duration::from_secs(30)).await.unwrap();
        let done = claimed[0].id;
        let busy = claimed[1].id;
        store
            .update_status(done, TransactionStatus::Success, Some("abc".into()), None)
            .await
            .unwrap();

        let err = store.mark_synced(&[done, busy]).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::AppError::State(StateError::SyncMismatch { expected: 2, updated: 1 })
        ));
        assert!(store.get(done).await.unwrap().synced_at.is_none());

        store.mark_synced(&[done]).await.unwrap();
        assert!(store.get(done).await.unwrap().synced_at.is_some());
        // a second sync of the same row is a double-sync
        assert!(store.mark_synced(&[done]).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stale_ready_skips_pending() {
        let payments = MemoryPaymentStore::new();
        let old = Utc::now() - chrono::Duration::days(10);

        let mut stale = Payment::draft("t1", "5", "XLM", None, "GDEST");
        stale.status = PaymentStatus::Ready;
        stale.status_history = StatusHistory::new();
        stale.status_history.append_at(old - chrono::Duration::days(1), PaymentStatus::Draft, None);
        stale.status_history.append_at(old, PaymentStatus::Ready, None);
        let mut pending = stale.clone();
        pending.id = Uuid::new_v4();
        pending.status = PaymentStatus::Pending;
        let fresh = {
            let mut p = Payment::draft("t1", "5", "XLM", None, "GDEST");
            p.transition(PaymentStatus::Ready, None).unwrap();
            p
        };
        for p in [&stale, &pending, &fresh] {
            payments.insert(p.clone()).await.unwrap();
        }

        let canceled = payments
            .cancel_stale_ready(Utc::now() - chrono::Duration::days(5), "canceled after 5 days of inactivity")
            .await
            .unwrap();

        assert_eq!(canceled, vec![stale.id]);
        let stale_after = payments.get(stale.id).await.unwrap();
        assert_eq!(stale_after.status, PaymentStatus::Canceled);
        assert_eq!(
            stale_after.status_history.last().and_then(|e| e.message.clone()).as_deref(),
            Some("canceled after 5 days of inactivity")
        );
        assert_eq!(payments.get(pending.id).await.unwrap().status, PaymentStatus::Pending);
        assert_eq!(payments.get(fresh.id).await.unwrap().status, PaymentStatus::Ready);
    }
}
