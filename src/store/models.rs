use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;
use crate::store::history::StatusHistory;

/// Payment status, owned by the disbursement platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Draft,
    Ready,
    Pending,
    Paused,
    Success,
    Failed,
    Canceled,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Draft => "DRAFT",
            PaymentStatus::Ready => "READY",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paused => "PAUSED",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Canceled => "CANCELED",
        }
    }

    pub fn all() -> [PaymentStatus; 7] {
        [
            PaymentStatus::Draft,
            PaymentStatus::Ready,
            PaymentStatus::Pending,
            PaymentStatus::Paused,
            PaymentStatus::Success,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
        ]
    }

    /// No further automatic transition happens from these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Success | PaymentStatus::Failed | PaymentStatus::Canceled
        )
    }
}

/// Status of a submission transaction row, owned by TSS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Success => "success",
            TransactionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "signing_backend", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SigningBackend {
    Env,
    Pool,
    Custody,
}

impl fmt::Display for SigningBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SigningBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningBackend::Env => "env",
            SigningBackend::Pool => "pool",
            SigningBackend::Custody => "custody",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "account_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountState {
    Provisioning,
    Active,
    Retired,
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountState::Provisioning => "provisioning",
            AccountState::Active => "active",
            AccountState::Retired => "retired",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "memo_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MemoType {
    Text,
    Id,
    Hash,
}

impl FromStr for MemoType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MemoType::Text),
            "id" => Ok(MemoType::Id),
            "hash" => Ok(MemoType::Hash),
            other => Err(AppError::InvalidInput(format!("unknown memo type {:?}", other))),
        }
    }
}

/// Payment record as the disbursement platform stores it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: String,
    pub disbursement_id: Option<Uuid>,
    pub receiver_wallet_id: Option<Uuid>,
    /// Decimal string, at most 7 fractional digits.
    pub amount: String,
    pub asset_code: String,
    pub asset_issuer: Option<String>,
    pub destination: String,
    pub memo: Option<String>,
    pub memo_type: Option<MemoType>,
    pub status: PaymentStatus,
    pub status_history: StatusHistory<PaymentStatus>,
    pub network_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// New Draft payment with a single history entry.
    pub fn draft(
        tenant_id: impl Into<String>,
        amount: impl Into<String>,
        asset_code: impl Into<String>,
        asset_issuer: Option<String>,
        destination: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            disbursement_id: None,
            receiver_wallet_id: None,
            amount: amount.into(),
            asset_code: asset_code.into(),
            asset_issuer,
            destination: destination.into(),
            memo: None,
            memo_type: None,
            status: PaymentStatus::Draft,
            status_history: StatusHistory::starting_with(PaymentStatus::Draft, None),
            network_tx_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One submission attempt cycle for a payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionTransaction {
    pub id: Uuid,
    /// Originating payment id.
    pub external_id: Uuid,
    pub tenant_id: String,
    pub status: TransactionStatus,
    pub status_message: Option<String>,
    pub status_history: StatusHistory<TransactionStatus>,
    pub destination: String,
    pub amount: String,
    pub asset_code: String,
    pub asset_issuer: Option<String>,
    pub memo: Option<String>,
    pub memo_type: Option<MemoType>,
    /// Pays for the payment. Also the transaction source unless a channel account is set.
    pub distribution_account: String,
    /// Pool channel account sourcing the current attempt.
    pub channel_account: Option<String>,
    pub network_tx_hash: Option<String>,
    /// Signed envelope of the current attempt, base64 XDR.
    pub envelope_xdr: Option<String>,
    pub sequence_number: Option<i64>,
    pub min_ledger: Option<u32>,
    pub max_ledger: Option<u32>,
    pub needs_fee_bump: bool,
    pub fee_bump_attempts: i32,
    pub attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    /// Lease expiry. `None` while claimed means the row is parked.
    pub locked_until: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionTransaction {
    pub fn ledger_window(&self) -> Option<LedgerWindow> {
        match (self.min_ledger, self.max_ledger) {
            (Some(min_ledger), Some(max_ledger)) => Some(LedgerWindow { min_ledger, max_ledger }),
            _ => None,
        }
    }

    /// Claimable right now, ignoring account state.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let backoff_elapsed = self.retry_after.map_or(true, |t| t <= now);
        let lease_free = match self.status {
            TransactionStatus::Pending => true,
            TransactionStatus::Processing => self.locked_until.map_or(false, |t| t < now),
            _ => false,
        };
        lease_free && backoff_elapsed && self.synced_at.is_none()
    }
}

/// Input for a new submission row
#[derive(Debug, Clone)]
pub struct NewSubmissionTransaction {
    pub external_id: Uuid,
    pub tenant_id: String,
    pub destination: String,
    pub amount: String,
    pub asset_code: String,
    pub asset_issuer: Option<String>,
    pub memo: Option<String>,
    pub memo_type: Option<MemoType>,
    pub distribution_account: String,
}

impl NewSubmissionTransaction {
    pub fn for_payment(payment: &Payment, distribution_account: impl Into<String>) -> Self {
        Self {
            external_id: payment.id,
            tenant_id: payment.tenant_id.clone(),
            destination: payment.destination.clone(),
            amount: payment.amount.clone(),
            asset_code: payment.asset_code.clone(),
            asset_issuer: payment.asset_issuer.clone(),
            memo: payment.memo.clone(),
            memo_type: payment.memo_type,
            distribution_account: distribution_account.into(),
        }
    }

    pub fn into_transaction(self) -> SubmissionTransaction {
        let now = Utc::now();
        SubmissionTransaction {
            id: Uuid::new_v4(),
            external_id: self.external_id,
            tenant_id: self.tenant_id,
            status: TransactionStatus::Pending,
            status_message: None,
            status_history: StatusHistory::starting_with(TransactionStatus::Pending, None),
            destination: self.destination,
            amount: self.amount,
            asset_code: self.asset_code,
            asset_issuer: self.asset_issuer,
            memo: self.memo,
            memo_type: self.memo_type,
            distribution_account: self.distribution_account,
            channel_account: None,
            network_tx_hash: None,
            envelope_xdr: None,
            sequence_number: None,
            min_ledger: None,
            max_ledger: None,
            needs_fee_bump: false,
            fee_bump_attempts: 0,
            attempts: 0,
            locked_at: None,
            locked_until: None,
            retry_after: None,
            completed_at: None,
            synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ledger-bounded validity window, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerWindow {
    pub min_ledger: u32,
    pub max_ledger: u32,
}

impl LedgerWindow {
    pub fn starting_at(current: u32, horizon: u32) -> Self {
        Self {
            min_ledger: current,
            max_ledger: current.saturating_add(horizon),
        }
    }

    pub fn is_open_at(&self, ledger: u32) -> bool {
        ledger <= self.max_ledger
    }
}

/// What was built and signed for one attempt; persisted before submission.
#[derive(Debug, Clone)]
pub struct SubmissionAttempt {
    pub hash: String,
    pub envelope_xdr: String,
    pub sequence_number: i64,
    pub window: LedgerWindow,
    pub fee_bump: bool,
    /// Transaction source when it is not the distribution account.
    pub channel_account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionAccount {
    pub public_key: String,
    pub backend: SigningBackend,
    pub state: AccountState,
    /// Reserved for an in-flight transaction until this ledger has passed.
    pub locked_until_ledger: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DistributionAccount {
    pub fn new(public_key: impl Into<String>, backend: SigningBackend, state: AccountState) -> Self {
        let now = Utc::now();
        Self {
            public_key: public_key.into(),
            backend,
            state,
            locked_until_ledger: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Free at `ledger` when never locked or the lock ledger is behind it.
    pub fn is_idle_at(&self, ledger: u32) -> bool {
        self.locked_until_ledger.map_or(true, |until| until < ledger)
    }
}
