use async_trait::async_trait;
use std::sync::Arc;
use stellar_xdr::curr::{FeeBumpTransaction, Transaction, TransactionEnvelope};
use tracing::{debug, info};

use crate::error::{AppResult, SigningError};
use crate::signing::keys::KeyPair;
use crate::signing::vault::KeyVault;
use crate::signing::{dedupe_accounts, sign_fee_bump_locally, sign_locally, unauthorized, SignatureService};
use crate::store::models::{AccountState, DistributionAccount, SigningBackend};
use crate::store::DistributionAccountStore;

/// Rotating accounts whose encrypted seeds live in the account store.
pub struct PoolSignatureService {
    store: Arc<dyn DistributionAccountStore>,
    vault: KeyVault,
    network_passphrase: String,
}

impl PoolSignatureService {
    pub fn new(store: Arc<dyn DistributionAccountStore>, vault: KeyVault, network_passphrase: &str) -> Self {
        Self {
            store,
            vault,
            network_passphrase: network_passphrase.to_string(),
        }
    }

    /// Loads a key for every account, failing before any signature is made.
    async fn authorize(&self, accounts: &[String]) -> AppResult<Vec<KeyPair>> {
        let accounts = dedupe_accounts(accounts)?;
        let mut keys = Vec::with_capacity(accounts.len());

        for account in &accounts {
            let record = match self.store.get_account(account).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => return Err(unauthorized(SigningBackend::Pool, account).into()),
                Err(e) => return Err(e),
            };
            if record.backend != SigningBackend::Pool || record.state != AccountState::Active {
                return Err(unauthorized(SigningBackend::Pool, account).into());
            }

            let sealed = self
                .store
                .load_secret(account)
                .await?
                .ok_or_else(|| unauthorized(SigningBackend::Pool, account))?;
            let key = KeyPair::from_secret_seed(&self.vault.decrypt(&sealed)?)?;
            if key.public_key() != account {
                return Err(SigningError::InvalidKey(format!("stored secret does not match account {}", account)).into());
            }
            keys.push(key);
        }

        Ok(keys)
    }
}

#[async_trait]
impl SignatureService for PoolSignatureService {
    fn backend(&self) -> SigningBackend {
        SigningBackend::Pool
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    async fn sign(&self, tx: &Transaction, accounts: &[String]) -> AppResult<TransactionEnvelope> {
        let keys = self.authorize(accounts).await?;
        debug!(signers = keys.len(), "signing transaction with pool accounts");
        sign_locally(tx, &keys, &self.network_passphrase)
    }

    async fn sign_fee_bump(
        &self,
        fee_bump: &FeeBumpTransaction,
        accounts: &[String],
    ) -> AppResult<TransactionEnvelope> {
        let keys = self.authorize(accounts).await?;
        sign_fee_bump_locally(fee_bump, &keys, &self.network_passphrase)
    }

    /// New accounts start in `provisioning`; they only sign once activated.
    async fn provision(&self, count: usize) -> AppResult<Vec<String>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let key = KeyPair::random();
            let sealed = self.vault.encrypt(&key.secret_seed())?;
            let account = DistributionAccount::new(key.public_key(), SigningBackend::Pool, AccountState::Provisioning);
            self.store.upsert(account, Some(sealed)).await?;
            created.push(key.public_key().to_string());
        }
        info!(count = created.len(), "🔑 provisioned pool accounts");
        Ok(created)
    }

    /// Marks the account retired; the store forgets its secret.
    async fn retire(&self, public_key: &str) -> AppResult<()> {
        let account = self.store.get_account(public_key).await?;
        if account.backend != SigningBackend::Pool {
            return Err(unauthorized(SigningBackend::Pool, public_key).into());
        }
        self.store.set_state(public_key, AccountState::Retired).await?;
        info!(account = %public_key, "pool account retired");
        Ok(())
    }
}
