use async_trait::async_trait;
use stellar_xdr::curr::{FeeBumpTransaction, Transaction, TransactionEnvelope};
use tracing::debug;

use crate::error::{AppResult, SigningError};
use crate::signing::keys::KeyPair;
use crate::signing::{dedupe_accounts, sign_fee_bump_locally, sign_locally, unauthorized, SignatureService};
use crate::store::models::SigningBackend;

/// Single distribution key loaded from configuration.
///
/// Signing only reads the key, so workers share it without locking.
pub struct EnvSignatureService {
    key: KeyPair,
    public_key: String,
    network_passphrase: String,
}

impl EnvSignatureService {
    pub fn new(secret_seed: &str, network_passphrase: &str) -> Result<Self, SigningError> {
        let key = KeyPair::from_secret_seed(secret_seed)?;
        Ok(Self {
            public_key: key.public_key().to_string(),
            key,
            network_passphrase: network_passphrase.to_string(),
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    fn authorize(&self, accounts: &[String]) -> Result<&KeyPair, SigningError> {
        for account in dedupe_accounts(accounts)? {
            if account != self.public_key {
                return Err(unauthorized(SigningBackend::Env, &account));
            }
        }
        Ok(&self.key)
    }
}

#[async_trait]
impl SignatureService for EnvSignatureService {
    fn backend(&self) -> SigningBackend {
        SigningBackend::Env
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    async fn sign(&self, tx: &Transaction, accounts: &[String]) -> AppResult<TransactionEnvelope> {
        let key = self.authorize(accounts)?;
        debug!(account = %self.public_key, "signing transaction");
        sign_locally(tx, std::slice::from_ref(key), &self.network_passphrase)
    }

    async fn sign_fee_bump(
        &self,
        fee_bump: &FeeBumpTransaction,
        accounts: &[String],
    ) -> AppResult<TransactionEnvelope> {
        let key = self.authorize(accounts)?;
        sign_fee_bump_locally(fee_bump, std::slice::from_ref(key), &self.network_passphrase)
    }

    async fn provision(&self, _count: usize) -> AppResult<Vec<String>> {
        Err(SigningError::Unsupported("env".into()).into())
    }

    async fn retire(&self, _public_key: &str) -> AppResult<()> {
        Err(SigningError::Unsupported("env".into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TEST_NETWORK_PASSPHRASE;
    use crate::error::AppError;
    use crate::network::envelope::{build_payment, envelope_hash, transaction_hash, PaymentParams};
    use crate::store::models::LedgerWindow;

    fn service() -> (EnvSignatureService, KeyPair) {
        let key = KeyPair::random();
        let service = EnvSignatureService::new(&key.secret_seed(), TEST_NETWORK_PASSPHRASE).unwrap();
        (service, key)
    }

    fn payment_tx(source: &str) -> Transaction {
        let dest = KeyPair::random();
        build_payment(&PaymentParams {
            source,
            payment_source: None,
            destination: dest.public_key(),
            amount: "1",
            asset_code: "XLM",
            asset_issuer: None,
            memo: None,
            memo_type: None,
            sequence: 1,
            base_fee: 100,
            window: LedgerWindow::starting_at(100, 10),
            max_time: 1_900_000_000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_signs_for_its_account() {
        let (service, key) = service();
        let tx = payment_tx(key.public_key());
        let envelope = service.sign(&tx, &[key.public_key().to_string()]).await.unwrap();
        assert_eq!(
            envelope_hash(&envelope, TEST_NETWORK_PASSPHRASE).unwrap(),
            transaction_hash(&tx, TEST_NETWORK_PASSPHRASE).unwrap()
        );
        match envelope {
            TransactionEnvelope::Tx(v1) => assert_eq!(v1.signatures.len(), 1),
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_workers_share_the_key() {
        let (service, key) = service();
        let service = std::sync::Arc::new(service);
        let account = key.public_key().to_string();
        let txs: Vec<Transaction> = (0..16).map(|_| payment_tx(key.public_key())).collect();

        let handles: Vec<_> = txs
            .iter()
            .cloned()
            .map(|tx| {
                let service = service.clone();
                let account = account.clone();
                tokio::spawn(async move { service.sign(&tx, &[account]).await.unwrap() })
            })
            .collect();

        for (tx, handle) in txs.iter().zip(handles) {
            let concurrent = handle.await.unwrap();
            let sequential = service.sign(tx, &[account.clone()]).await.unwrap();
            assert_eq!(concurrent, sequential);
        }
    }

    #[tokio::test]
    async fn test_mixed_accounts_sign_nothing() {
        let (service, key) = service();
        let other = KeyPair::random();
        let tx = payment_tx(key.public_key());
        let err = service
            .sign(&tx, &[key.public_key().to_string(), other.public_key().to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Signing(SigningError::Unauthorized(ref a)) if a == other.public_key()));
        assert!(err.is_authorization());
    }

    #[tokio::test]
    async fn test_lifecycle_is_unsupported() {
        let (service, key) = service();
        assert!(matches!(
            service.provision(1).await,
            Err(AppError::Signing(SigningError::Unsupported(_)))
        ));
        assert!(matches!(
            service.retire(key.public_key()).await,
            Err(AppError::Signing(SigningError::Unsupported(_)))
        ));
    }
}
