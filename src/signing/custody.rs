use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use stellar_xdr::curr::{FeeBumpTransaction, Transaction, TransactionEnvelope};
use tracing::{instrument, warn};

use crate::error::{AppResult, SigningError};
use crate::network::envelope::{
    decode_envelope, encode_envelope, envelope_hash, fee_bump_envelope, fee_bump_hash, signed_envelope,
    transaction_hash,
};
use crate::signing::{dedupe_accounts, unauthorized, SignatureService};
use crate::store::models::SigningBackend;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodySignRequest {
    pub account: String,
    pub network_passphrase: String,
    /// Unsigned envelope, base64 XDR.
    pub envelope_xdr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodySignResponse {
    pub signed_envelope_xdr: String,
}

/// Request/response channel to the custody provider.
#[async_trait]
pub trait CustodyTransport: Send + Sync {
    async fn sign(&self, request: &CustodySignRequest) -> Result<CustodySignResponse, SigningError>;
}

pub struct HttpCustodyTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpCustodyTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/sign", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl CustodyTransport for HttpCustodyTransport {
    async fn sign(&self, request: &CustodySignRequest) -> Result<CustodySignResponse, SigningError> {
        let response = self.client.post(&self.url).json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                SigningError::CustodyTimeout
            } else {
                SigningError::CustodyUnavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SigningError::CustodyRejected(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(SigningError::CustodyUnavailable(format!("custody returned {}", status)));
        }

        response
            .json::<CustodySignResponse>()
            .await
            .map_err(|e| SigningError::CustodyUnavailable(format!("unreadable custody response: {}", e)))
    }
}

/// External custody signing for one fixed distribution account.
pub struct CustodySignatureService {
    transport: Arc<dyn CustodyTransport>,
    account: String,
    network_passphrase: String,
    timeout: Duration,
}

impl CustodySignatureService {
    pub fn new(
        transport: Arc<dyn CustodyTransport>,
        account: &str,
        network_passphrase: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            account: account.to_string(),
            network_passphrase: network_passphrase.to_string(),
            timeout,
        }
    }

    fn authorize(&self, accounts: &[String]) -> Result<(), SigningError> {
        for account in dedupe_accounts(accounts)? {
            if account != self.account {
                return Err(unauthorized(SigningBackend::Custody, &account));
            }
        }
        Ok(())
    }

    /// Sends the unsigned envelope and checks the custody answer signs the same transaction.
    async fn request_signature(&self, unsigned: TransactionEnvelope, expected: [u8; 32]) -> AppResult<TransactionEnvelope> {
        let request = CustodySignRequest {
            account: self.account.clone(),
            network_passphrase: self.network_passphrase.clone(),
            envelope_xdr: encode_envelope(&unsigned)?,
        };

        let response = match tokio::time::timeout(self.timeout, self.transport.sign(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(account = %self.account, timeout_ms = self.timeout.as_millis() as u64, "custody signing timed out");
                return Err(SigningError::CustodyTimeout.into());
            }
        };

        let signed = decode_envelope(&response.signed_envelope_xdr)
            .map_err(|e| SigningError::CustodyRejected(format!("custody returned an invalid envelope: {}", e)))?;
        if envelope_hash(&signed, &self.network_passphrase)? != expected {
            return Err(SigningError::CustodyRejected("custody signed a different transaction".into()).into());
        }
        Ok(signed)
    }
}

#[async_trait]
impl SignatureService for CustodySignatureService {
    fn backend(&self) -> SigningBackend {
        SigningBackend::Custody
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    #[instrument(skip_all, fields(account = %self.account))]
    async fn sign(&self, tx: &Transaction, accounts: &[String]) -> AppResult<TransactionEnvelope> {
        self.authorize(accounts)?;
        let expected = transaction_hash(tx, &self.network_passphrase)?;
        self.request_signature(signed_envelope(tx.clone(), vec![])?, expected).await
    }

    #[instrument(skip_all, fields(account = %self.account))]
    async fn sign_fee_bump(
        &self,
        fee_bump: &FeeBumpTransaction,
        accounts: &[String],
    ) -> AppResult<TransactionEnvelope> {
        self.authorize(accounts)?;
        let expected = fee_bump_hash(fee_bump, &self.network_passphrase)?;
        self.request_signature(fee_bump_envelope(fee_bump.clone(), vec![])?, expected).await
    }

    async fn provision(&self, _count: usize) -> AppResult<Vec<String>> {
        Err(SigningError::Unsupported("custody".into()).into())
    }

    async fn retire(&self, _public_key: &str) -> AppResult<()> {
        Err(SigningError::Unsupported("custody".into()).into())
    }
}
