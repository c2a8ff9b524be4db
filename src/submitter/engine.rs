use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use stellar_xdr::curr::TransactionEnvelope;
use tracing::{error, info, instrument, warn};

use crate::accounts::ChannelAccountsService;
use crate::config::Config;
use crate::error::{AppError, AppResult, SigningError, SubmissionError};
use crate::events::{EventProducer, Message};
use crate::ledger::LedgerTracker;
use crate::network::envelope::{
    build_fee_bump, build_payment, decode_envelope, encode_envelope, envelope_hash, envelope_sequence, inner_hash,
    max_time_from_now, merge_signatures, PaymentParams, TX_TIMEOUT_SECS,
};
use crate::network::{NetworkClient, Rejection, RejectionClass, SubmitFailure};
use crate::shutdown::{deadline, ShutdownSignal};
use crate::signing::SignatureService;
use crate::store::models::{LedgerWindow, SubmissionAttempt, SubmissionTransaction, TransactionStatus};
use crate::store::TransactionStore;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Per-operation fee, in stroops.
    pub base_fee: u32,
    pub fee_bump_multiplier: u32,
    pub max_fee_bumps: i32,
    pub ledger_horizon: u32,
    pub network_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_fee: config.max_base_fee,
            fee_bump_multiplier: config.fee_bump_multiplier,
            max_fee_bumps: config.max_fee_bumps,
            ledger_horizon: config.ledger_horizon,
            network_timeout: config.network_timeout(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

/// What happened to one claimed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { hash: String, ledger: u32 },
    Failed { code: String, reason: String },
    /// Back to pending with a backoff.
    Retry { reason: String, indeterminate: bool },
    /// Claimed without a lease until an operator releases it.
    Parked { reason: String },
    /// Shutdown interrupted the attempt; the row is pending again.
    Cancelled,
}

impl Outcome {
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Outcome::Retry { indeterminate: true, .. })
    }
}

enum Reconciled {
    Settled(Outcome),
    Open(LedgerWindow),
    Expired,
}

/// Builds, signs, and submits one payment transaction per claimed row.
///
/// The distribution account is always debited and signed for by `signer`.
/// With channel accounts attached, each attempt is sourced by a locked channel
/// account that co-signs, so concurrent payments do not share a sequence number.
pub struct SubmitterEngine {
    store: Arc<dyn TransactionStore>,
    signer: Arc<dyn SignatureService>,
    channels: Option<Arc<ChannelAccountsService>>,
    network: Arc<dyn NetworkClient>,
    ledger: Arc<LedgerTracker>,
    events: Arc<dyn EventProducer>,
    settings: EngineSettings,
}

impl SubmitterEngine {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        signer: Arc<dyn SignatureService>,
        network: Arc<dyn NetworkClient>,
        ledger: Arc<LedgerTracker>,
        events: Arc<dyn EventProducer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            signer,
            channels: None,
            network,
            ledger,
            events,
            settings,
        }
    }

    pub fn with_channels(mut self, channels: Arc<ChannelAccountsService>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Drives a claimed row to its next resting state.
    ///
    /// Only terminal rejections fail the payment. Anything transient returns
    /// the row to the queue, and an `Err` means the outcome itself could not
    /// be persisted (the lease expires and the row is reclaimed).
    #[instrument(skip_all, fields(tx_id = %tx.id, payment_id = %tx.external_id, tenant_id = %tx.tenant_id))]
    pub async fn process(&self, tx: &SubmissionTransaction, shutdown: &ShutdownSignal) -> AppResult<Outcome> {
        match self.attempt(tx, shutdown).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.settle_error(tx, e).await,
        }
    }

    async fn attempt(&self, tx: &SubmissionTransaction, shutdown: &ShutdownSignal) -> AppResult<Outcome> {
        let reading = self.ledger.current_ledger().await?;
        if reading.stale {
            warn!(ledger = reading.ledger, "⚠️ ledger reading is stale, using it anyway");
        }

        if let Some(hash) = tx.network_tx_hash.as_deref() {
            match self.reconcile(tx, hash, reading.ledger, shutdown).await? {
                Reconciled::Settled(outcome) => return Ok(outcome),
                Reconciled::Open(window) => return self.resubmit(tx, hash, window, shutdown).await,
                Reconciled::Expired => {
                    info!(%hash, ledger = reading.ledger, "previous attempt expired unseen, rebuilding");
                    self.store.clear_attempt(tx.id).await?;
                }
            }
        }

        self.build_and_submit(tx, reading.ledger, shutdown).await
    }

    // ========== RECONCILIATION ==========

    /// Looks up an attempt persisted by an earlier cycle.
    ///
    /// The attempt is only given up once neither the recorded hash nor the
    /// inner transaction it wraps is on chain and its window has closed.
    async fn reconcile(
        &self,
        tx: &SubmissionTransaction,
        hash: &str,
        current: u32,
        shutdown: &ShutdownSignal,
    ) -> AppResult<Reconciled> {
        let mut found = deadline(shutdown, self.settings.network_timeout, self.network.transaction_status(hash)).await?;
        if found.is_none() {
            if let Some(inner) = self.unbumped_hash(tx, hash)? {
                found = deadline(shutdown, self.settings.network_timeout, self.network.transaction_status(&inner)).await?;
            }
        }

        if let Some(on_chain) = found {
            let outcome = if on_chain.successful {
                self.succeed(tx, on_chain.hash, on_chain.ledger).await?
            } else {
                self.fail(
                    tx,
                    "tx_failed".to_string(),
                    format!("transaction {} failed on chain in ledger {}", hash, on_chain.ledger),
                )
                .await?
            };
            return Ok(Reconciled::Settled(outcome));
        }

        match tx.ledger_window() {
            Some(window) if window.is_open_at(current) => Ok(Reconciled::Open(window)),
            _ => Ok(Reconciled::Expired),
        }
    }

    /// Hash of the recorded inner envelope when the recorded hash is a fee-bump of it.
    fn unbumped_hash(&self, tx: &SubmissionTransaction, hash: &str) -> AppResult<Option<String>> {
        let Some(envelope_xdr) = tx.envelope_xdr.as_deref() else {
            return Ok(None);
        };
        let inner = hex::encode(inner_hash(&decode_envelope(envelope_xdr)?, self.signer.network_passphrase())?);
        Ok((inner != hash).then_some(inner))
    }

    /// Sends the recorded attempt again, or a fee-bump of it when one was requested.
    async fn resubmit(
        &self,
        tx: &SubmissionTransaction,
        hash: &str,
        window: LedgerWindow,
        shutdown: &ShutdownSignal,
    ) -> AppResult<Outcome> {
        let inner_xdr = tx
            .envelope_xdr
            .as_deref()
            .ok_or_else(|| AppError::Internal(format!("attempt {} has a hash but no envelope", hash)))?;
        let inner = decode_envelope(inner_xdr)?;

        if tx.needs_fee_bump {
            if tx.fee_bump_attempts >= self.settings.max_fee_bumps {
                let reason = format!(
                    "fee bump limit of {} reached, waiting for ledger {} to pass",
                    self.settings.max_fee_bumps, window.max_ledger
                );
                return self.retry(tx, reason, false).await;
            }
            return self.fee_bump(tx, inner, tx.fee_bump_attempts + 1, window, shutdown).await;
        }

        let inner_tx_hash = hex::encode(envelope_hash(&inner, self.signer.network_passphrase())?);
        if inner_tx_hash == hash {
            return self.submit(tx, inner_xdr, hash, window, shutdown).await;
        }

        // the recorded hash belongs to an earlier fee-bump of this envelope
        self.fee_bump(tx, inner, tx.fee_bump_attempts, window, shutdown).await
    }

    // ========== BUILD AND SUBMIT ==========

    async fn build_and_submit(
        &self,
        tx: &SubmissionTransaction,
        current: u32,
        shutdown: &ShutdownSignal,
    ) -> AppResult<Outcome> {
        let window = LedgerWindow::starting_at(current, self.settings.ledger_horizon);
        let channel = match &self.channels {
            // held until the attempt can no longer land
            Some(channels) => match channels.acquire(current, window.max_ledger).await? {
                Some(channel) => Some(channel),
                None => return self.retry(tx, "every channel account is busy".to_string(), false).await,
            },
            None => None,
        };
        let source = channel.as_deref().unwrap_or(tx.distribution_account.as_str());

        let sequence = match deadline(shutdown, self.settings.network_timeout, self.network.account_sequence(source)).await {
            Ok(Some(sequence)) => sequence + 1,
            Ok(None) if channel.is_some() => {
                // left locked so the next attempt picks another channel
                warn!(channel = %source, "⚠️ channel account missing on the network");
                let reason = format!("channel account {} does not exist on the network", source);
                return self.retry(tx, reason, false).await;
            }
            Ok(None) => {
                return Err(SubmissionError::TerminalRejection {
                    code: "tx_no_source_account".into(),
                    reason: format!("distribution account {} does not exist on the network", source),
                }
                .into())
            }
            Err(e) => {
                self.release_channel(channel.as_deref()).await;
                return Err(e);
            }
        };

        let envelope = match self.sign_payment(tx, channel.as_deref(), sequence, window, shutdown).await {
            Ok(envelope) => envelope,
            Err(e) => {
                self.release_channel(channel.as_deref()).await;
                return Err(e);
            }
        };
        let hash = hex::encode(envelope_hash(&envelope, self.signer.network_passphrase())?);
        let envelope_xdr = encode_envelope(&envelope)?;

        self.store
            .save_attempt(
                tx.id,
                SubmissionAttempt {
                    hash: hash.clone(),
                    envelope_xdr: envelope_xdr.clone(),
                    sequence_number: sequence,
                    window,
                    fee_bump: false,
                    channel_account: channel,
                },
            )
            .await?;

        self.submit(tx, &envelope_xdr, &hash, window, shutdown).await
    }

    /// Builds the payment and collects the channel and distribution signatures.
    async fn sign_payment(
        &self,
        tx: &SubmissionTransaction,
        channel: Option<&str>,
        sequence: i64,
        window: LedgerWindow,
        shutdown: &ShutdownSignal,
    ) -> AppResult<TransactionEnvelope> {
        let account = tx.distribution_account.as_str();
        let transaction = build_payment(&PaymentParams {
            source: channel.unwrap_or(account),
            payment_source: Some(account),
            destination: &tx.destination,
            amount: &tx.amount,
            asset_code: &tx.asset_code,
            asset_issuer: tx.asset_issuer.as_deref(),
            memo: tx.memo.as_deref(),
            memo_type: tx.memo_type,
            sequence,
            base_fee: self.settings.base_fee,
            window,
            max_time: max_time_from_now(TX_TIMEOUT_SECS),
        })?;

        let timeout = self.settings.network_timeout;
        let by_distribution = deadline(shutdown, timeout, self.signer.sign(&transaction, &[account.to_string()])).await?;
        match (channel, &self.channels) {
            (Some(channel), Some(channels)) => {
                let by_channel = deadline(
                    shutdown,
                    timeout,
                    channels.signer().sign(&transaction, &[channel.to_string()]),
                )
                .await?;
                merge_signatures(by_channel, by_distribution)
            }
            _ => Ok(by_distribution),
        }
    }

    /// Wraps the signed inner envelope at a higher fee; the sequence number is kept.
    async fn fee_bump(
        &self,
        tx: &SubmissionTransaction,
        inner: TransactionEnvelope,
        round: i32,
        window: LedgerWindow,
        shutdown: &ShutdownSignal,
    ) -> AppResult<Outcome> {
        let account = tx.distribution_account.as_str();
        let multiplier = self.settings.fee_bump_multiplier.saturating_mul(round.max(1) as u32);
        let fee_bump = build_fee_bump(&inner, account, self.settings.base_fee, multiplier)?;

        let accounts = [account.to_string()];
        let envelope = deadline(
            shutdown,
            self.settings.network_timeout,
            self.signer.sign_fee_bump(&fee_bump, &accounts),
        )
        .await?;
        let hash = hex::encode(envelope_hash(&envelope, self.signer.network_passphrase())?);
        let envelope_xdr = encode_envelope(&envelope)?;

        if tx.network_tx_hash.as_deref() != Some(hash.as_str()) {
            let sequence_number = envelope_sequence(&envelope)
                .or(tx.sequence_number)
                .ok_or_else(|| AppError::Internal("fee-bump envelope has no sequence number".into()))?;
            self.store
                .save_attempt(
                    tx.id,
                    SubmissionAttempt {
                        hash: hash.clone(),
                        envelope_xdr: envelope_xdr.clone(),
                        sequence_number,
                        window,
                        fee_bump: true,
                        channel_account: None,
                    },
                )
                .await?;
            info!(%hash, fee = fee_bump.fee, round, "⛽ fee-bumping transaction");
        }

        self.submit(tx, &envelope_xdr, &hash, window, shutdown).await
    }

    /// The window is checked against the latest ledger immediately before sending.
    async fn submit(
        &self,
        tx: &SubmissionTransaction,
        envelope_xdr: &str,
        hash: &str,
        window: LedgerWindow,
        shutdown: &ShutdownSignal,
    ) -> AppResult<Outcome> {
        let current = self.ledger.current_ledger().await?.ledger;
        if !window.is_open_at(current) {
            return Err(SubmissionError::WindowExpired {
                max_ledger: window.max_ledger,
                current,
            }
            .into());
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(AppError::Cancelled),
            result = self.network.submit(envelope_xdr) => result,
        };

        match result {
            Ok(submitted) => self.succeed(tx, submitted.hash, submitted.ledger).await,
            Err(SubmitFailure::Timeout) => {
                let reason = format!("submission of {} timed out, on-chain status checked next cycle", hash);
                self.retry(tx, reason, false).await
            }
            Err(SubmitFailure::Network(e)) => self.retry(tx, format!("network error: {}", e), false).await,
            Err(SubmitFailure::Rejected(rejection)) => self.classify(tx, rejection).await,
        }
    }

    async fn classify(&self, tx: &SubmissionTransaction, rejection: Rejection) -> AppResult<Outcome> {
        let indeterminate = rejection.is_indeterminate();
        let reason = rejection.reason();
        match rejection.classify() {
            RejectionClass::Terminal => self.fail(tx, rejection.code(), reason).await,
            RejectionClass::FeeTooLow => {
                self.store.request_fee_bump(tx.id).await?;
                self.retry(tx, reason, indeterminate).await
            }
            RejectionClass::BadSequence | RejectionClass::Expired => {
                // an earlier send of this attempt may have landed; reconcile decides next cycle
                self.retry(tx, reason, indeterminate).await
            }
            RejectionClass::RateLimited | RejectionClass::Transient => self.retry(tx, reason, indeterminate).await,
        }
    }

    // ========== OUTCOMES ==========

    async fn settle_error(&self, tx: &SubmissionTransaction, e: AppError) -> AppResult<Outcome> {
        if matches!(e, AppError::Cancelled) {
            self.store
                .unclaim(tx.id, None, Some("cancelled by shutdown".into()))
                .await?;
            return Ok(Outcome::Cancelled);
        }

        match e {
            AppError::Submission(SubmissionError::TerminalRejection { code, reason }) => {
                self.fail(tx, code, reason).await
            }
            AppError::Signing(SigningError::CustodyRejected(reason)) => {
                self.fail(tx, "custody_rejected".to_string(), reason).await
            }
            e if e.is_authorization() => {
                error!(account = %tx.distribution_account, error = %e, "🚫 signing refused, parking transaction");
                self.park(tx, e.to_string()).await
            }
            e if e.is_transient() => self.retry(tx, e.to_string(), false).await,
            e => {
                error!(error = %e, "unexpected submission error, parking transaction");
                self.park(tx, e.to_string()).await
            }
        }
    }

    async fn succeed(&self, tx: &SubmissionTransaction, hash: String, ledger: u32) -> AppResult<Outcome> {
        let updated = self
            .store
            .update_status(
                tx.id,
                TransactionStatus::Success,
                Some(hash.clone()),
                Some(format!("confirmed in ledger {}", ledger)),
            )
            .await?;
        info!(%hash, ledger, amount = %tx.amount, asset = %tx.asset_code, "✅ payment transaction confirmed");
        self.release_attempt_channel(&updated).await;
        self.emit(&updated).await;
        Ok(Outcome::Succeeded { hash, ledger })
    }

    async fn fail(&self, tx: &SubmissionTransaction, code: String, reason: String) -> AppResult<Outcome> {
        let message = if reason.contains(&code) {
            reason.clone()
        } else {
            format!("{}: {}", code, reason)
        };
        let updated = self
            .store
            .update_status(tx.id, TransactionStatus::Error, None, Some(message))
            .await?;
        warn!(%code, %reason, "❌ payment transaction rejected");
        self.release_attempt_channel(&updated).await;
        self.emit(&updated).await;
        Ok(Outcome::Failed { code, reason })
    }

    async fn retry(&self, tx: &SubmissionTransaction, reason: String, indeterminate: bool) -> AppResult<Outcome> {
        let delay = self.backoff(tx.attempts);
        let retry_after = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.unclaim(tx.id, Some(retry_after), Some(reason.clone())).await?;
        info!(delay_ms = delay.as_millis() as u64, attempts = tx.attempts, %reason, "🔁 transaction returned to queue");
        Ok(Outcome::Retry { reason, indeterminate })
    }

    async fn park(&self, tx: &SubmissionTransaction, reason: String) -> AppResult<Outcome> {
        self.store.park(tx.id, reason.clone()).await?;
        Ok(Outcome::Parked { reason })
    }

    /// Frees the channel of a finished row while its lock is still the row's own.
    /// Once the window has passed the lock has lapsed and may belong to another row.
    async fn release_attempt_channel(&self, tx: &SubmissionTransaction) {
        let (Some(channel), Some(window)) = (tx.channel_account.as_deref(), tx.ledger_window()) else {
            return;
        };
        match self.ledger.current_ledger().await {
            Ok(reading) if window.is_open_at(reading.ledger) => self.release_channel(Some(channel)).await,
            _ => {}
        }
    }

    async fn release_channel(&self, channel: Option<&str>) {
        let (Some(channel), Some(channels)) = (channel, &self.channels) else {
            return;
        };
        if let Err(e) = channels.release(channel).await {
            warn!(%channel, error = %e, "channel account not released, its lock lapses with the window");
        }
    }

    async fn emit(&self, tx: &SubmissionTransaction) {
        let message = match Message::payment_completed(tx) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "could not build completion event");
                return;
            }
        };
        if let Err(e) = self.events.write(vec![message]).await {
            warn!(error = %e, "completion event not delivered, polling sync will pick the row up");
        }
    }

    /// Exponential in the attempt count, capped, with jitter in `[d/2, d]`.
    fn backoff(&self, attempts: i32) -> Duration {
        let base = self.settings.backoff_base.as_millis() as u64;
        let max = self.settings.backoff_max.as_millis().max(1) as u64;
        let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
        let delay = base.saturating_mul(1u64 << exponent).min(max);
        let jittered = if delay > 1 {
            rand::rng().random_range(delay / 2..=delay)
        } else {
            delay
        };
        Duration::from_millis(jittered)
    }
}
