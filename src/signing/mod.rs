pub mod custody;
pub mod env;
pub mod keys;
pub mod pool;
pub mod resolver;
pub mod vault;

use async_trait::async_trait;
use stellar_xdr::curr::{DecoratedSignature, FeeBumpTransaction, Transaction, TransactionEnvelope};
use tracing::error;

use crate::error::{AppResult, SigningError};
use crate::network::envelope::{fee_bump_envelope, fee_bump_hash, signed_envelope, transaction_hash};
use crate::store::models::SigningBackend;
use keys::KeyPair;

/// Capability set shared by every signing backend.
///
/// Implementations check every requested account before producing any
/// signature: a single unauthorized account fails the whole call.
#[async_trait]
pub trait SignatureService: Send + Sync {
    fn backend(&self) -> SigningBackend;

    fn network_passphrase(&self) -> &str;

    async fn sign(&self, tx: &Transaction, accounts: &[String]) -> AppResult<TransactionEnvelope>;

    async fn sign_fee_bump(
        &self,
        fee_bump: &FeeBumpTransaction,
        accounts: &[String],
    ) -> AppResult<TransactionEnvelope>;

    /// Creates `count` new accounts and returns their public keys.
    async fn provision(&self, count: usize) -> AppResult<Vec<String>>;

    async fn retire(&self, public_key: &str) -> AppResult<()>;
}

/// Drops duplicate accounts, keeping the first occurrence.
pub(crate) fn dedupe_accounts(accounts: &[String]) -> Result<Vec<String>, SigningError> {
    if accounts.is_empty() {
        return Err(SigningError::NoAccounts);
    }
    let mut unique: Vec<String> = Vec::with_capacity(accounts.len());
    for account in accounts {
        if !unique.contains(account) {
            unique.push(account.clone());
        }
    }
    Ok(unique)
}

pub(crate) fn unauthorized(backend: SigningBackend, account: &str) -> SigningError {
    error!(%backend, %account, "🚫 signature requested for an account this backend does not control");
    SigningError::Unauthorized(account.to_string())
}

/// Signs with already-authorized local keys.
pub(crate) fn sign_locally(tx: &Transaction, keys: &[KeyPair], passphrase: &str) -> AppResult<TransactionEnvelope> {
    let hash = transaction_hash(tx, passphrase)?;
    let signatures = sign_all(keys, &hash)?;
    signed_envelope(tx.clone(), signatures)
}

pub(crate) fn sign_fee_bump_locally(
    fee_bump: &FeeBumpTransaction,
    keys: &[KeyPair],
    passphrase: &str,
) -> AppResult<TransactionEnvelope> {
    let hash = fee_bump_hash(fee_bump, passphrase)?;
    let signatures = sign_all(keys, &hash)?;
    fee_bump_envelope(fee_bump.clone(), signatures)
}

fn sign_all(keys: &[KeyPair], hash: &[u8; 32]) -> AppResult<Vec<DecoratedSignature>> {
    keys.iter()
        .map(|key| key.sign_hash(hash).map_err(Into::into))
        .collect()
}
