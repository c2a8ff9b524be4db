pub mod history;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod state_machine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppResult;
use models::{
    AccountState, DistributionAccount, NewSubmissionTransaction, Payment, PaymentStatus,
    SigningBackend, SubmissionAttempt, SubmissionTransaction, TransactionStatus,
};

/// Durable submission queue owned by TSS.
///
/// INVARIANTS:
/// - A row has at most one active claim. Concurrent `claim_batch` callers
///   never receive the same row.
/// - `synced_at` is written once, and only for rows already in a terminal state.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, new: NewSubmissionTransaction) -> AppResult<SubmissionTransaction>;

    async fn get(&self, id: Uuid) -> AppResult<SubmissionTransaction>;

    /// Latest row for a payment that is not yet synced, if any.
    async fn find_unsynced_for_payment(&self, payment_id: Uuid) -> AppResult<Option<SubmissionTransaction>>;

    /// Atomically claims up to `limit` claimable rows whose distribution account
    /// is active, moving them to processing under a lease of `lease`.
    /// `limit <= 0` fails with an invalid-argument error.
    async fn claim_batch(&self, limit: i64, lease: Duration) -> AppResult<Vec<SubmissionTransaction>>;

    /// Persists what was built and signed. Called before every submission.
    /// A fee-bump keeps the inner envelope and its channel account.
    async fn save_attempt(&self, id: Uuid, attempt: SubmissionAttempt) -> AppResult<()>;

    /// Forgets the current attempt so the next cycle rebuilds from scratch.
    async fn clear_attempt(&self, id: Uuid) -> AppResult<()>;

    async fn request_fee_bump(&self, id: Uuid) -> AppResult<()>;

    /// Appends to history. Repeating a terminal write is a no-op.
    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        hash: Option<String>,
        message: Option<String>,
    ) -> AppResult<SubmissionTransaction>;

    /// Processing -> pending, not claimable again before `retry_after`.
    async fn unclaim(&self, id: Uuid, retry_after: Option<DateTime<Utc>>, message: Option<String>) -> AppResult<()>;

    /// Keeps the claim without a lease so no worker picks the row up again.
    async fn park(&self, id: Uuid, reason: String) -> AppResult<()>;

    /// Operator action: returns a parked row to the queue.
    async fn release(&self, id: Uuid) -> AppResult<()>;

    /// Terminal rows of one tenant not yet absorbed by the platform, oldest first.
    async fn get_unsynced_terminal(&self, tenant_id: &str, limit: i64) -> AppResult<Vec<SubmissionTransaction>>;

    /// Sets `synced_at` on every id. Fails unless every row is terminal and unsynced.
    async fn mark_synced(&self, ids: &[Uuid]) -> AppResult<()>;
}

/// Payment records owned by the disbursement platform.
///
/// Every status change goes through the payment state machine and appends to history.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, payment: Payment) -> AppResult<Payment>;

    async fn get(&self, id: Uuid) -> AppResult<Payment>;

    async fn list_by_status(&self, tenant_id: &str, status: PaymentStatus, limit: i64) -> AppResult<Vec<Payment>>;

    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        message: Option<String>,
        network_tx_id: Option<String>,
    ) -> AppResult<Payment>;

    async fn retry_failed(&self, id: Uuid, user_email: &str) -> AppResult<Payment>;

    /// Cancels Ready payments whose latest Ready entry is at or before `cutoff`.
    async fn cancel_stale_ready(&self, cutoff: DateTime<Utc>, message: &str) -> AppResult<Vec<Uuid>>;
}

/// Distribution/channel accounts, managed by the Signature Service of their backend.
#[async_trait]
pub trait DistributionAccountStore: Send + Sync {
    async fn upsert(&self, account: DistributionAccount, encrypted_secret: Option<String>) -> AppResult<()>;

    async fn get_account(&self, public_key: &str) -> AppResult<DistributionAccount>;

    async fn list_accounts(
        &self,
        backend: Option<SigningBackend>,
        state: Option<AccountState>,
    ) -> AppResult<Vec<DistributionAccount>>;

    /// Retiring an account also drops its encrypted secret.
    async fn set_state(&self, public_key: &str, state: AccountState) -> AppResult<()>;

    /// Locks an active pool account idle at `current_ledger` until `until_ledger`,
    /// preferring the one locked longest ago. `None` when every account is busy.
    async fn lock_idle_channel(&self, current_ledger: u32, until_ledger: u32) -> AppResult<Option<String>>;

    /// Locks one account if it is idle at `current_ledger`. Returns `false` when it is held.
    async fn lock_account(&self, public_key: &str, current_ledger: u32, until_ledger: u32) -> AppResult<bool>;

    async fn unlock_account(&self, public_key: &str) -> AppResult<()>;

    async fn load_secret(&self, public_key: &str) -> AppResult<Option<String>>;

    async fn delete_account(&self, public_key: &str) -> AppResult<()>;
}
