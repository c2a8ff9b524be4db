use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, AppResult, StateError, StoreError};
use crate::store::history::StatusHistory;
use crate::store::models::{
    AccountState, DistributionAccount, NewSubmissionTransaction, Payment, PaymentStatus,
    SigningBackend, SubmissionAttempt, SubmissionTransaction, TransactionStatus,
};
use crate::store::{DistributionAccountStore, PaymentStore, TransactionStore};

const TX_COLUMNS: &str = "id, external_id, tenant_id, status, status_message, status_history, \
    destination, amount::text AS amount, asset_code, asset_issuer, memo, memo_type, distribution_account, \
    channel_account, network_tx_hash, envelope_xdr, sequence_number, min_ledger, max_ledger, needs_fee_bump, \
    fee_bump_attempts, attempts, locked_at, locked_until, retry_after, completed_at, synced_at, \
    created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, tenant_id, disbursement_id, receiver_wallet_id, amount::text AS amount, \
    asset_code, asset_issuer, destination, memo, memo_type, status, status_history, network_tx_id, \
    created_at, updated_at";

fn transaction_from_row(row: &PgRow) -> AppResult<SubmissionTransaction> {
    let history: Json<StatusHistory<TransactionStatus>> = row.try_get("status_history")?;
    let min_ledger: Option<i32> = row.try_get("min_ledger")?;
    let max_ledger: Option<i32> = row.try_get("max_ledger")?;
    Ok(SubmissionTransaction {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: row.try_get("status")?,
        status_message: row.try_get("status_message")?,
        status_history: history.0,
        destination: row.try_get("destination")?,
        amount: row.try_get("amount")?,
        asset_code: row.try_get("asset_code")?,
        asset_issuer: row.try_get("asset_issuer")?,
        memo: row.try_get("memo")?,
        memo_type: row.try_get("memo_type")?,
        distribution_account: row.try_get("distribution_account")?,
        channel_account: row.try_get("channel_account")?,
        network_tx_hash: row.try_get("network_tx_hash")?,
        envelope_xdr: row.try_get("envelope_xdr")?,
        sequence_number: row.try_get("sequence_number")?,
        min_ledger: min_ledger.map(|l| l as u32),
        max_ledger: max_ledger.map(|l| l as u32),
        needs_fee_bump: row.try_get("needs_fee_bump")?,
        fee_bump_attempts: row.try_get("fee_bump_attempts")?,
        attempts: row.try_get("attempts")?,
        locked_at: row.try_get("locked_at")?,
        locked_until: row.try_get("locked_until")?,
        retry_after: row.try_get("retry_after")?,
        completed_at: row.try_get("completed_at")?,
        synced_at: row.try_get("synced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> AppResult<Payment> {
    let history: Json<StatusHistory<PaymentStatus>> = row.try_get("status_history")?;
    Ok(Payment {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        disbursement_id: row.try_get("disbursement_id")?,
        receiver_wallet_id: row.try_get("receiver_wallet_id")?,
        amount: row.try_get("amount")?,
        asset_code: row.try_get("asset_code")?,
        asset_issuer: row.try_get("asset_issuer")?,
        destination: row.try_get("destination")?,
        memo: row.try_get("memo")?,
        memo_type: row.try_get("memo_type")?,
        status: row.try_get("status")?,
        status_history: history.0,
        network_tx_id: row.try_get("network_tx_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const ACCOUNT_COLUMNS: &str = "public_key, backend, state, locked_until_ledger, created_at, updated_at";

fn account_from_row(row: &PgRow) -> AppResult<DistributionAccount> {
    let locked_until_ledger: Option<i32> = row.try_get("locked_until_ledger")?;
    Ok(DistributionAccount {
        public_key: row.try_get("public_key")?,
        backend: row.try_get("backend")?,
        state: row.try_get("state")?,
        locked_until_ledger: locked_until_ledger.map(|l| l as u32),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// TSS database: `submission_transactions` and `distribution_accounts`.
pub struct PgTssStore {
    pool: PgPool,
}

impl PgTssStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========== ROW HELPERS ==========

    async fn lock_row(
        db_tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> AppResult<SubmissionTransaction> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM submission_transactions WHERE id = $1 FOR UPDATE",
            TX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **db_tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("submission transaction {}", id)))?;
        transaction_from_row(&row)
    }

    async fn persist(db_tx: &mut Transaction<'_, Postgres>, tx: &SubmissionTransaction) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE submission_transactions
            SET status = $2, status_message = $3, status_history = $4, network_tx_hash = $5,
                envelope_xdr = $6, sequence_number = $7, min_ledger = $8, max_ledger = $9,
                needs_fee_bump = $10, fee_bump_attempts = $11, attempts = $12, locked_at = $13,
                locked_until = $14, retry_after = $15, completed_at = $16, synced_at = $17,
                updated_at = $18, channel_account = $19
            WHERE id = $1
            "#,
        )
        .bind(tx.id)
        .bind(tx.status)
        .bind(&tx.status_message)
        .bind(Json(&tx.status_history))
        .bind(&tx.network_tx_hash)
        .bind(&tx.envelope_xdr)
        .bind(tx.sequence_number)
        .bind(tx.min_ledger.map(|l| l as i32))
        .bind(tx.max_ledger.map(|l| l as i32))
        .bind(tx.needs_fee_bump)
        .bind(tx.fee_bump_attempts)
        .bind(tx.attempts)
        .bind(tx.locked_at)
        .bind(tx.locked_until)
        .bind(tx.retry_after)
        .bind(tx.completed_at)
        .bind(tx.synced_at)
        .bind(tx.updated_at)
        .bind(&tx.channel_account)
        .execute(&mut **db_tx)
        .await?;
        Ok(())
    }

    /// Locks one row, applies `f` to it, and writes it back in a single transaction.
    async fn modify<F>(&self, id: Uuid, f: F) -> AppResult<SubmissionTransaction>
    where
        F: FnOnce(&mut SubmissionTransaction) -> AppResult<()> + Send,
    {
        let mut db_tx = self.pool.begin().await?;
        let mut tx = Self::lock_row(&mut db_tx, id).await?;
        f(&mut tx)?;
        Self::persist(&mut db_tx, &tx).await?;
        db_tx.commit().await?;
        Ok(tx)
    }
}

#[async_trait]
impl TransactionStore for PgTssStore {
    async fn insert(&self, new: NewSubmissionTransaction) -> AppResult<SubmissionTransaction> {
        let tx = new.into_transaction();
        sqlx::query(
            r#"
            INSERT INTO submission_transactions (
                id, external_id, tenant_id, status, status_history, destination, amount,
                asset_code, asset_issuer, memo, memo_type, distribution_account, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7::numeric, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(tx.id)
        .bind(tx.external_id)
        .bind(&tx.tenant_id)
        .bind(tx.status)
        .bind(Json(&tx.status_history))
        .bind(&tx.destination)
        .bind(&tx.amount)
        .bind(&tx.asset_code)
        .bind(&tx.asset_issuer)
        .bind(&tx.memo)
        .bind(tx.memo_type)
        .bind(&tx.distribution_account)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(tx)
    }

    async fn get(&self, id: Uuid) -> AppResult<SubmissionTransaction> {
        let row = sqlx::query(&format!("SELECT {} FROM submission_transactions WHERE id = $1", TX_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("submission transaction {}", id)))?;
        transaction_from_row(&row)
    }

    async fn find_unsynced_for_payment(&self, payment_id: Uuid) -> AppResult<Option<SubmissionTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM submission_transactions WHERE external_id = $1 AND synced_at IS NULL \
             ORDER BY created_at DESC LIMIT 1",
            TX_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn claim_batch(&self, limit: i64, lease: Duration) -> AppResult<Vec<SubmissionTransaction>> {
        if limit <= 0 {
            return Err(StoreError::InvalidArgument(format!("limit must be positive, got {}", limit)).into());
        }

        let mut db_tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM submission_transactions t
            WHERE t.synced_at IS NULL
              AND (t.status = 'pending'
                   OR (t.status = 'processing' AND t.locked_until IS NOT NULL AND t.locked_until < NOW()))
              AND (t.retry_after IS NULL OR t.retry_after <= NOW())
              AND EXISTS (
                  SELECT 1 FROM distribution_accounts a
                  WHERE a.public_key = t.distribution_account AND a.state = 'active'
              )
            ORDER BY t.created_at
            LIMIT $1
            FOR UPDATE OF t SKIP LOCKED
            "#,
            TX_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&mut *db_tx)
        .await?;

        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::InvalidArgument(format!("lease out of range: {}", e)))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut tx = transaction_from_row(row)?;
            if tx.status == TransactionStatus::Processing {
                tx.transition(TransactionStatus::Pending, None, Some("lease expired".into()))?;
            }
            tx.transition(TransactionStatus::Processing, None, None)?;
            tx.locked_until = Some(now + lease);
            Self::persist(&mut db_tx, &tx).await?;
            claimed.push(tx);
        }
        db_tx.commit().await?;
        Ok(claimed)
    }

    async fn save_attempt(&self, id: Uuid, attempt: SubmissionAttempt) -> AppResult<()> {
        self.modify(id, move |tx| {
            tx.network_tx_hash = Some(attempt.hash);
            if attempt.fee_bump {
                tx.fee_bump_attempts += 1;
                tx.needs_fee_bump = false;
            } else {
                tx.envelope_xdr = Some(attempt.envelope_xdr);
                tx.channel_account = attempt.channel_account;
            }
            tx.sequence_number = Some(attempt.sequence_number);
            tx.min_ledger = Some(attempt.window.min_ledger);
            tx.max_ledger = Some(attempt.window.max_ledger);
            tx.updated_at = Utc::now();
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn clear_attempt(&self, id: Uuid) -> AppResult<()> {
        self.modify(id, |tx| {
            tx.network_tx_hash = None;
            tx.envelope_xdr = None;
            tx.channel_account = None;
            tx.sequence_number = None;
            tx.min_ledger = None;
            tx.max_ledger = None;
            tx.needs_fee_bump = false;
            tx.updated_at = Utc::now();
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn request_fee_bump(&self, id: Uuid) -> AppResult<()> {
        self.modify(id, |tx| {
            tx.needs_fee_bump = true;
            tx.updated_at = Utc::now();
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        hash: Option<String>,
        message: Option<String>,
    ) -> AppResult<SubmissionTransaction> {
        self.modify(id, move |tx| {
            tx.transition(status, hash, message)?;
            Ok(())
        })
        .await
    }

    async fn unclaim(&self, id: Uuid, retry_after: Option<DateTime<Utc>>, message: Option<String>) -> AppResult<()> {
        self.modify(id, move |tx| {
            tx.transition(TransactionStatus::Pending, None, message)?;
            tx.retry_after = retry_after;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn park(&self, id: Uuid, reason: String) -> AppResult<()> {
        self.modify(id, move |tx| {
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
        })
        .await
        .map(|_| ())
    }

    async fn release(&self, id: Uuid) -> AppResult<()> {
        self.modify(id, |tx| {
            tx.transition(TransactionStatus::Pending, None, Some("released by operator".into()))?;
            tx.retry_after = None;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn get_unsynced_terminal(&self, tenant_id: &str, limit: i64) -> AppResult<Vec<SubmissionTransaction>> {
        if limit <= 0 {
            return Err(StoreError::InvalidArgument(format!("limit must be positive, got {}", limit)).into());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM submission_transactions
            WHERE tenant_id = $1
              AND status IN ('success', 'error')
              AND synced_at IS NULL
            ORDER BY completed_at ASC
            LIMIT $2
            "#,
            TX_COLUMNS
        ))
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn mark_synced(&self, ids: &[Uuid]) -> AppResult<()> {
        if ids.is_empty() {
            return Err(StoreError::InvalidArgument("no transaction ids to mark synced".into()).into());
        }

        let mut db_tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE submission_transactions
            SET synced_at = NOW(), updated_at = NOW()
            WHERE id = ANY($1)
              AND status IN ('success', 'error')
              AND synced_at IS NULL
            "#,
        )
        .bind(ids.to_vec())
        .execute(&mut *db_tx)
        .await?;

        let updated = result.rows_affected() as usize;
        if updated != ids.len() {
            db_tx.rollback().await?;
            return Err(StateError::SyncMismatch {
                expected: ids.len(),
                updated,
            }
            .into());
        }
        db_tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DistributionAccountStore for PgTssStore {
    async fn upsert(&self, account: DistributionAccount, encrypted_secret: Option<String>) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO distribution_accounts (public_key, backend, state, encrypted_secret, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (public_key) DO UPDATE
            SET backend = EXCLUDED.backend,
                state = EXCLUDED.state,
                encrypted_secret = CASE
                    WHEN EXCLUDED.state = 'retired' THEN NULL
                    ELSE COALESCE(EXCLUDED.encrypted_secret, distribution_accounts.encrypted_secret)
                END,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&account.public_key)
        .bind(account.backend)
        .bind(account.state)
        .bind(encrypted_secret)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, public_key: &str) -> AppResult<DistributionAccount> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM distribution_accounts WHERE public_key = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(public_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("distribution account {}", public_key)))?;
        account_from_row(&row)
    }

    async fn list_accounts(
        &self,
        backend: Option<SigningBackend>,
        state: Option<AccountState>,
    ) -> AppResult<Vec<DistributionAccount>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM distribution_accounts
            WHERE ($1::signing_backend IS NULL OR backend = $1)
              AND ($2::account_state IS NULL OR state = $2)
            ORDER BY created_at, public_key
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(backend)
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn set_state(&self, public_key: &str, state: AccountState) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE distribution_accounts
            SET state = $2,
                encrypted_secret = CASE WHEN $2 = 'retired'::account_state THEN NULL ELSE encrypted_secret END,
                updated_at = NOW()
            WHERE public_key = $1
            "#,
        )
        .bind(public_key)
        .bind(state)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("distribution account {}", public_key)).into());
        }
        Ok(())
    }

    async fn lock_idle_channel(&self, current_ledger: u32, until_ledger: u32) -> AppResult<Option<String>> {
        let row = sqlx::query(
            r#"
            UPDATE distribution_accounts
            SET locked_until_ledger = $2, updated_at = NOW()
            WHERE public_key = (
                SELECT public_key FROM distribution_accounts
                WHERE backend = 'pool'
                  AND state = 'active'
                  AND (locked_until_ledger IS NULL OR locked_until_ledger < $1)
                ORDER BY locked_until_ledger NULLS FIRST, public_key
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING public_key
            "#,
        )
        .bind(current_ledger as i32)
        .bind(until_ledger.min(i32::MAX as u32) as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get::<String, _>("public_key")).transpose()?)
    }

    async fn lock_account(&self, public_key: &str, current_ledger: u32, until_ledger: u32) -> AppResult<bool> {
        let mut db_tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM distribution_accounts WHERE public_key = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(public_key)
        .fetch_optional(&mut *db_tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("distribution account {}", public_key)))?;
        if !account_from_row(&row)?.is_idle_at(current_ledger) {
            db_tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE distribution_accounts SET locked_until_ledger = $2, updated_at = NOW() WHERE public_key = $1")
            .bind(public_key)
            .bind(until_ledger.min(i32::MAX as u32) as i32)
            .execute(&mut *db_tx)
            .await?;
        db_tx.commit().await?;
        Ok(true)
    }

    async fn unlock_account(&self, public_key: &str) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE distribution_accounts SET locked_until_ledger = NULL, updated_at = NOW() WHERE public_key = $1",
        )
        .bind(public_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("distribution account {}", public_key)).into());
        }
        Ok(())
    }

    async fn load_secret(&self, public_key: &str) -> AppResult<Option<String>> {
        let row = sqlx::query("SELECT encrypted_secret FROM distribution_accounts WHERE public_key = $1")
            .bind(public_key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("distribution account {}", public_key)))?;
        Ok(row.try_get("encrypted_secret")?)
    }

    async fn delete_account(&self, public_key: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM distribution_accounts WHERE public_key = $1")
            .bind(public_key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("distribution account {}", public_key)).into());
        }
        Ok(())
    }
}

/// Platform database: `payments`.
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn persist(db_tx: &mut Transaction<'_, Postgres>, payment: &Payment) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, status_history = $3, network_tx_id = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.status)
        .bind(Json(&payment.status_history))
        .bind(&payment.network_tx_id)
        .bind(payment.updated_at)
        .execute(&mut **db_tx)
        .await?;
        Ok(())
    }

    async fn modify<F>(&self, id: Uuid, f: F) -> AppResult<Payment>
    where
        F: FnOnce(&mut Payment) -> AppResult<()> + Send,
    {
        let mut db_tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {} FROM payments WHERE id = $1 FOR UPDATE", PAYMENT_COLUMNS))
            .bind(id)
            .fetch_optional(&mut *db_tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;
        let mut payment = payment_from_row(&row)?;
        f(&mut payment)?;
        Self::persist(&mut db_tx, &payment).await?;
        db_tx.commit().await?;
        Ok(payment)
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert(&self, payment: Payment) -> AppResult<Payment> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, tenant_id, disbursement_id, receiver_wallet_id, amount, asset_code, asset_issuer,
                destination, memo, memo_type, status, status_history, network_tx_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(payment.id)
        .bind(&payment.tenant_id)
        .bind(payment.disbursement_id)
        .bind(payment.receiver_wallet_id)
        .bind(&payment.amount)
        .bind(&payment.asset_code)
        .bind(&payment.asset_issuer)
        .bind(&payment.destination)
        .bind(&payment.memo)
        .bind(payment.memo_type)
        .bind(payment.status)
        .bind(Json(&payment.status_history))
        .bind(&payment.network_tx_id)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn get(&self, id: Uuid) -> AppResult<Payment> {
        let row = sqlx::query(&format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;
        payment_from_row(&row)
    }

    async fn list_by_status(&self, tenant_id: &str, status: PaymentStatus, limit: i64) -> AppResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payments WHERE tenant_id = $1 AND status = $2 ORDER BY created_at LIMIT $3",
            PAYMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        message: Option<String>,
        network_tx_id: Option<String>,
    ) -> AppResult<Payment> {
        self.modify(id, move |payment| {
            payment.transition(to, message)?;
            if network_tx_id.is_some() {
                payment.network_tx_id = network_tx_id;
            }
            Ok(())
        })
        .await
    }

    async fn retry_failed(&self, id: Uuid, user_email: &str) -> AppResult<Payment> {
        let user_email = user_email.to_string();
        self.modify(id, move |payment| payment.retry(&user_email).map_err(AppError::from))
            .await
    }

    async fn cancel_stale_ready(&self, cutoff: DateTime<Utc>, message: &str) -> AppResult<Vec<Uuid>> {
        let mut db_tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM payments
            WHERE status = 'READY'
              AND (
                  SELECT MAX((entry->>'timestamp')::timestamptz)
                  FROM jsonb_array_elements(status_history) AS entry
                  WHERE entry->>'status' = 'READY'
              ) <= $1
            FOR UPDATE SKIP LOCKED
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&mut *db_tx)
        .await?;

        let mut canceled = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut payment = payment_from_row(row)?;
            payment.transition(PaymentStatus::Canceled, Some(message.to_string()))?;
            Self::persist(&mut db_tx, &payment).await?;
            canceled.push(payment.id);
        }
        db_tx.commit().await?;
        Ok(canceled)
    }
}
