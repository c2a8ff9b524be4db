use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::accounts::VerifyReport;
use crate::ledger::TrackerStatus;
use crate::store::models::{Payment, PaymentStatus, SubmissionTransaction, TransactionStatus};

// ========== REQUEST MODELS ==========

/// Failed -> Ready, on behalf of an operator
#[derive(Debug, Deserialize, Validate)]
pub struct RetryPaymentRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub user_email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ProvisionAccountsRequest {
    #[validate(range(min = 1, max = 1000, message = "must be between 1 and 1000"))]
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct VerifyAccountsQuery {
    #[serde(default)]
    pub delete_invalid: bool,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ledger: TrackerStatus,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub tenant_id: String,
    pub status: PaymentStatus,
    pub amount: String,
    pub asset_code: String,
    pub destination: String,
    pub stellar_transaction_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            tenant_id: payment.tenant_id,
            status: payment.status,
            amount: payment.amount,
            asset_code: payment.asset_code,
            destination: payment.destination,
            stellar_transaction_id: payment.network_tx_id,
            updated_at: payment.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub status: TransactionStatus,
    pub status_message: Option<String>,
    pub distribution_account: String,
    pub stellar_transaction_id: Option<String>,
    pub attempts: i32,
    pub fee_bump_attempts: i32,
    /// Claimed without a lease: waiting for an operator.
    pub parked: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

impl From<SubmissionTransaction> for TransactionResponse {
    fn from(tx: SubmissionTransaction) -> Self {
        Self {
            parked: tx.status == TransactionStatus::Processing && tx.locked_until.is_none(),
            id: tx.id,
            payment_id: tx.external_id,
            status: tx.status,
            status_message: tx.status_message,
            distribution_account: tx.distribution_account,
            stellar_transaction_id: tx.network_tx_hash,
            attempts: tx.attempts,
            fee_bump_attempts: tx.fee_bump_attempts,
            synced_at: tx.synced_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub topic: String,
    /// Payments queued for submission by a `payment_ready` event.
    pub queued: Vec<Uuid>,
    /// Rows written back by a `payment_completed` event.
    pub synced: usize,
}

#[derive(Debug, Serialize)]
pub struct AccountsResponse {
    pub accounts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyAccountsResponse {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
    pub deleted: usize,
}

impl From<VerifyReport> for VerifyAccountsResponse {
    fn from(report: VerifyReport) -> Self {
        Self {
            valid: report.valid,
            invalid: report.invalid,
            deleted: report.deleted,
        }
    }
}
