//! Channel-account lifecycle for the pool signing backend.
//!
//! New accounts are generated by the pool Signature Service, funded on the
//! network by the distribution account, and only then activated. Retiring
//! merges the account back into the distribution account.
//!
//! A channel account sources one transaction at a time. It stays locked until
//! the last ledger that transaction can land in, and an account holding a lock
//! cannot be retired.

use std::sync::Arc;
use stellar_xdr::curr::{Memo, Operation};
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, MAX_CHANNEL_ACCOUNTS};
use crate::error::{AppError, AppResult, StoreError, SubmissionError};
use crate::ledger::LedgerTracker;
use crate::network::envelope::{
    account_merge_operation, build_transaction, create_account_operation, encode_envelope, max_time_from_now,
    TX_TIMEOUT_SECS,
};
use crate::network::NetworkClient;
use crate::signing::SignatureService;
use crate::store::models::{AccountState, LedgerWindow, SigningBackend};
use crate::store::DistributionAccountStore;

/// Network limit on operations per transaction.
const MAX_OPS_PER_TX: usize = 100;

#[derive(Debug, Clone)]
pub struct AccountSettings {
    pub base_fee: u32,
    pub ledger_horizon: u32,
    pub starting_balance: String,
}

impl AccountSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_fee: config.max_base_fee,
            ledger_horizon: config.ledger_horizon,
            starting_balance: config.channel_starting_balance.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
    pub deleted: usize,
}

pub struct ChannelAccountsService {
    store: Arc<dyn DistributionAccountStore>,
    pool: Arc<dyn SignatureService>,
    funder: Arc<dyn SignatureService>,
    funder_account: String,
    network: Arc<dyn NetworkClient>,
    ledger: Arc<LedgerTracker>,
    settings: AccountSettings,
}

impl ChannelAccountsService {
    pub fn new(
        store: Arc<dyn DistributionAccountStore>,
        pool: Arc<dyn SignatureService>,
        funder: Arc<dyn SignatureService>,
        funder_account: impl Into<String>,
        network: Arc<dyn NetworkClient>,
        ledger: Arc<LedgerTracker>,
        settings: AccountSettings,
    ) -> AppResult<Self> {
        if pool.backend() != SigningBackend::Pool {
            return Err(AppError::Fatal(format!(
                "channel accounts need the pool backend, got {}",
                pool.backend()
            )));
        }
        Ok(Self {
            store,
            pool,
            funder,
            funder_account: funder_account.into(),
            network,
            ledger,
            settings,
        })
    }

    async fn active_accounts(&self) -> AppResult<Vec<String>> {
        Ok(self
            .store
            .list_accounts(Some(SigningBackend::Pool), Some(AccountState::Active))
            .await?
            .into_iter()
            .map(|a| a.public_key)
            .collect())
    }

    /// Signs for channel accounts.
    pub fn signer(&self) -> &Arc<dyn SignatureService> {
        &self.pool
    }

    /// The distribution account that funds channels and pays for payments.
    pub fn funder_account(&self) -> &str {
        &self.funder_account
    }

    /// Reserves an idle channel account until `until_ledger`. `None` when all are busy.
    pub async fn acquire(&self, current_ledger: u32, until_ledger: u32) -> AppResult<Option<String>> {
        let channel = self.store.lock_idle_channel(current_ledger, until_ledger).await?;
        if let Some(account) = &channel {
            debug!(%account, until_ledger, "channel account locked");
        }
        Ok(channel)
    }

    pub async fn release(&self, public_key: &str) -> AppResult<()> {
        self.store.unlock_account(public_key).await?;
        debug!(account = %public_key, "channel account released");
        Ok(())
    }

    /// Provisions or retires accounts until `target` are active.
    /// Accounts sourcing an in-flight transaction are kept, so the result may exceed `target`.
    #[instrument(skip(self))]
    pub async fn ensure_count(&self, target: usize) -> AppResult<Vec<String>> {
        if target > MAX_CHANNEL_ACCOUNTS {
            return Err(AppError::InvalidInput(format!(
                "at most {} channel accounts are supported",
                MAX_CHANNEL_ACCOUNTS
            )));
        }
        let active = self.active_accounts().await?;
        if active.len() < target {
            self.create_accounts(target - active.len()).await?;
        } else if active.len() > target {
            let mut excess = active.len() - target;
            // newest first
            for account in active.iter().rev() {
                if excess == 0 {
                    break;
                }
                match self.retire(account).await {
                    Ok(()) => excess -= 1,
                    Err(AppError::Store(StoreError::Conflict(_))) => debug!(%account, "channel account busy, kept"),
                    Err(e) => return Err(e),
                }
            }
            if excess > 0 {
                warn!(excess, "⚠️ busy channel accounts kept above target");
            }
        }
        self.active_accounts().await
    }

    /// Provisions `count` accounts, funds them and activates the funded ones.
    /// Accounts whose funding failed are retired.
    #[instrument(skip(self))]
    pub async fn create_accounts(&self, count: usize) -> AppResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let provisioned = self.pool.provision(count).await?;
        let mut activated = Vec::with_capacity(provisioned.len());
        let mut first_error = None;

        for chunk in provisioned.chunks(MAX_OPS_PER_TX) {
            match self.fund(chunk).await {
                Ok(()) => {
                    for account in chunk {
                        self.store.set_state(account, AccountState::Active).await?;
                        activated.push(account.clone());
                    }
                }
                Err(e) => {
                    warn!(accounts = chunk.len(), "⚠️ funding channel accounts failed: {}", e);
                    for account in chunk {
                        self.pool.retire(account).await?;
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(requested = count, activated = activated.len(), "✅ channel accounts created");
        match first_error {
            Some(e) if activated.is_empty() => Err(e),
            _ => Ok(activated),
        }
    }

    async fn window(&self) -> AppResult<LedgerWindow> {
        let reading = self.ledger.current_ledger().await?;
        Ok(LedgerWindow::starting_at(reading.ledger, self.settings.ledger_horizon))
    }

    async fn fund(&self, accounts: &[String]) -> AppResult<()> {
        let sequence = self
            .network
            .account_sequence(&self.funder_account)
            .await?
            .ok_or_else(|| SubmissionError::TerminalRejection {
                code: "tx_no_source_account".into(),
                reason: format!("funding account {} does not exist", self.funder_account),
            })?;

        let operations = accounts
            .iter()
            .map(|account| create_account_operation(account, &self.settings.starting_balance))
            .collect::<AppResult<Vec<Operation>>>()?;
        let tx = build_transaction(
            &self.funder_account,
            sequence + 1,
            self.settings.base_fee,
            self.window().await?,
            max_time_from_now(TX_TIMEOUT_SECS),
            Memo::None,
            operations,
        )?;
        let envelope = self.funder.sign(&tx, &[self.funder_account.clone()]).await?;
        let result = self.network.submit(&encode_envelope(&envelope)?).await?;
        info!(hash = %result.hash, ledger = result.ledger, accounts = accounts.len(), "💰 channel accounts funded");
        Ok(())
    }

    /// Merges the account into the funding account and marks it retired.
    /// Accounts that never reached the network are only marked retired.
    /// Fails with a conflict while the account sources an in-flight transaction.
    #[instrument(skip(self))]
    pub async fn retire(&self, public_key: &str) -> AppResult<()> {
        let account = self.store.get_account(public_key).await?;
        if account.backend != SigningBackend::Pool {
            return Err(AppError::InvalidInput(format!("{} is not a pool account", public_key)));
        }

        // held for good; a retired account never sources another transaction
        let current = self.ledger.current_ledger().await?.ledger;
        if !self.store.lock_account(public_key, current, u32::MAX).await? {
            return Err(StoreError::Conflict(format!("channel account {} is in use", public_key)).into());
        }

        if let Err(e) = self.merge_and_retire(public_key, account.state).await {
            self.store.unlock_account(public_key).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn merge_and_retire(&self, public_key: &str, state: AccountState) -> AppResult<()> {
        let on_network = self.network.account_sequence(public_key).await?;
        if let (Some(sequence), AccountState::Active) = (on_network, state) {
            let tx = build_transaction(
                public_key,
                sequence + 1,
                self.settings.base_fee,
                self.window().await?,
                max_time_from_now(TX_TIMEOUT_SECS),
                Memo::None,
                vec![account_merge_operation(&self.funder_account)?],
            )?;
            let envelope = self.pool.sign(&tx, &[public_key.to_string()]).await?;
            let result = self.network.submit(&encode_envelope(&envelope)?).await?;
            info!(account = %public_key, hash = %result.hash, "channel account merged");
        }

        self.pool.retire(public_key).await
    }

    /// Checks every non-retired pool account exists on the network.
    #[instrument(skip(self))]
    pub async fn verify_accounts(&self, delete_invalid: bool) -> AppResult<VerifyReport> {
        let mut report = VerifyReport::default();
        let accounts = self.store.list_accounts(Some(SigningBackend::Pool), None).await?;

        for account in accounts.into_iter().filter(|a| a.state != AccountState::Retired) {
            if self.network.account_sequence(&account.public_key).await?.is_some() {
                report.valid.push(account.public_key);
                continue;
            }
            warn!(account = %account.public_key, state = %account.state, "channel account missing on network");
            if delete_invalid {
                self.store.delete_account(&account.public_key).await?;
                report.deleted += 1;
            }
            report.invalid.push(account.public_key);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TEST_NETWORK_PASSPHRASE;
    use crate::network::errors::Rejection;
    use crate::network::mock::MockNetwork;
    use crate::network::SubmitFailure;
    use crate::signing::env::EnvSignatureService;
    use crate::signing::keys::KeyPair;
    use crate::signing::pool::PoolSignatureService;
    use crate::signing::vault::KeyVault;
    use crate::store::memory::MemoryTssStore;
    use std::time::Duration;

    struct Harness {
        service: ChannelAccountsService,
        store: Arc<MemoryTssStore>,
        network: Arc<MockNetwork>,
    }

    async fn harness() -> Harness {
        let funder = KeyPair::random();
        let store = Arc::new(MemoryTssStore::new());
        let network = Arc::new(MockNetwork::at_ledger(1000));
        network.set_sequence(funder.public_key(), 55);
        let ledger = Arc::new(LedgerTracker::new(
            network.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_millis(200),
        ));
        let pool = Arc::new(PoolSignatureService::new(
            store.clone(),
            KeyVault::new("vault-pass").unwrap(),
            TEST_NETWORK_PASSPHRASE,
        ));
        let env = Arc::new(EnvSignatureService::new(&funder.secret_seed(), TEST_NETWORK_PASSPHRASE).unwrap());
        let service = ChannelAccountsService::new(
            store.clone(),
            pool,
            env,
            funder.public_key(),
            network.clone(),
            ledger,
            AccountSettings {
                base_fee: 100,
                ledger_horizon: 10,
                starting_balance: "1.5".into(),
            },
        )
        .unwrap();
        Harness { service, store, network }
    }

    #[tokio::test]
    async fn test_create_funds_and_activates() {
        let h = harness().await;
        let created = h.service.create_accounts(3).await.unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(h.network.submitted().len(), 1, "one funding transaction per chunk");

        for account in &created {
            let record = h.store.get_account(account).await.unwrap();
            assert_eq!(record.state, AccountState::Active);
            assert!(h.store.load_secret(account).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_failed_funding_retires_accounts() {
        let h = harness().await;
        h.network
            .push_response(Err(SubmitFailure::Rejected(Rejection::with_codes(400, "tx_insufficient_balance", &[]))));

        let result = h.service.create_accounts(2).await;
        assert!(result.unwrap_err().is_terminal_rejection());

        let retired = h
            .store
            .list_accounts(Some(SigningBackend::Pool), Some(AccountState::Retired))
            .await
            .unwrap();
        assert_eq!(retired.len(), 2);
        assert!(h.service.active_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_count_grows_and_shrinks() {
        let h = harness().await;
        assert_eq!(h.service.ensure_count(4).await.unwrap().len(), 4);

        let active = h.service.active_accounts().await.unwrap();
        for account in &active {
            h.network.set_sequence(account, 7);
        }
        let remaining = h.service.ensure_count(1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        // one funding transaction plus three merges
        assert_eq!(h.network.submitted().len(), 4);
        assert!(h.service.ensure_count(MAX_CHANNEL_ACCOUNTS + 1).await.is_err());
    }

    #[tokio::test]
    async fn test_retire_without_network_account_skips_merge() {
        let h = harness().await;
        let created = h.service.create_accounts(1).await.unwrap();
        let submitted = h.network.submitted().len();

        h.service.retire(&created[0]).await.unwrap();
        assert_eq!(h.network.submitted().len(), submitted);
        assert_eq!(h.store.get_account(&created[0]).await.unwrap().state, AccountState::Retired);
    }

    #[tokio::test]
    async fn test_busy_channel_is_not_retired() {
        let h = harness().await;
        let created = h.service.create_accounts(2).await.unwrap();
        for account in &created {
            h.network.set_sequence(account, 7);
        }

        let busy = h.service.acquire(1000, 1010).await.unwrap().unwrap();
        let err = h.service.retire(&busy).await.unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::Conflict(_))));
        assert_eq!(h.store.get_account(&busy).await.unwrap().state, AccountState::Active);

        // shrinking skips the busy account
        let remaining = h.service.ensure_count(1).await.unwrap();
        assert_eq!(remaining, vec![busy.clone()]);

        h.service.release(&busy).await.unwrap();
        h.service.retire(&busy).await.unwrap();
        assert_eq!(h.store.get_account(&busy).await.unwrap().state, AccountState::Retired);
        assert_eq!(h.store.load_secret(&busy).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_channel_usable() {
        let h = harness().await;
        let created = h.service.create_accounts(1).await.unwrap();
        h.network.set_sequence(&created[0], 7);
        h.network.push_response(Err(SubmitFailure::Timeout));

        assert!(h.service.retire(&created[0]).await.is_err());
        assert_eq!(h.store.get_account(&created[0]).await.unwrap().state, AccountState::Active);
        assert_eq!(h.service.acquire(1000, 1010).await.unwrap(), Some(created[0].clone()));
    }

    #[tokio::test]
    async fn test_verify_deletes_missing_accounts() {
        let h = harness().await;
        let created = h.service.create_accounts(2).await.unwrap();
        h.network.set_sequence(&created[0], 3);

        let report = h.service.verify_accounts(false).await.unwrap();
        assert_eq!(report.valid, vec![created[0].clone()]);
        assert_eq!(report.invalid, vec![created[1].clone()]);
        assert_eq!(report.deleted, 0);

        let report = h.service.verify_accounts(true).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(h.store.get_account(&created[1]).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_non_pool_signer() {
        let h = harness().await;
        let funder = KeyPair::random();
        let env = Arc::new(EnvSignatureService::new(&funder.secret_seed(), TEST_NETWORK_PASSPHRASE).unwrap());
        let result = ChannelAccountsService::new(
            h.store.clone(),
            env.clone(),
            env,
            funder.public_key(),
            h.network.clone(),
            Arc::new(LedgerTracker::new(
                h.network.clone(),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )),
            AccountSettings {
                base_fee: 100,
                ledger_horizon: 10,
                starting_balance: "1".into(),
            },
        );
        assert!(matches!(result, Err(AppError::Fatal(_))));
    }
}
