use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{AppError, AppResult, SubmissionError};
use crate::network::errors::{Rejection, RejectionClass};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub hash: String,
    pub ledger: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitFailure {
    Rejected(Rejection),
    /// No answer in time. The network may still include the transaction.
    Timeout,
    Network(String),
}

/// Flattens a failure for callers that do not reconcile, such as account funding.
impl From<SubmitFailure> for AppError {
    fn from(failure: SubmitFailure) -> Self {
        match failure {
            SubmitFailure::Rejected(rejection) if rejection.classify() == RejectionClass::Terminal => {
                SubmissionError::TerminalRejection {
                    code: rejection.code(),
                    reason: rejection.reason(),
                }
                .into()
            }
            SubmitFailure::Rejected(rejection) => SubmissionError::Transient(rejection.reason()).into(),
            SubmitFailure::Timeout => SubmissionError::Transient("submission timed out".into()).into(),
            SubmitFailure::Network(e) => SubmissionError::Transient(e).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainTransaction {
    pub hash: String,
    pub ledger: u32,
    pub successful: bool,
}

/// Ledger network access used by the tracker, the engine, and account services.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn latest_ledger(&self) -> AppResult<u32>;

    /// Current sequence number, `None` when the account does not exist.
    async fn account_sequence(&self, account: &str) -> AppResult<Option<i64>>;

    async fn submit(&self, envelope_xdr: &str) -> Result<SubmitResult, SubmitFailure>;

    /// `None` when the network has no record of the hash.
    async fn transaction_status(&self, hash: &str) -> AppResult<Option<OnChainTransaction>>;
}

/// Horizon REST client.
pub struct HorizonClient {
    client: reqwest::Client,
    base_url: String,
}

impl HorizonClient {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Fatal(format!("building horizon client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str) -> AppResult<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SubmissionError::Transient(format!("GET {} returned {}: {}", path, status, body)).into())
            }
        }
    }
}

#[async_trait]
impl NetworkClient for HorizonClient {
    #[instrument(skip(self))]
    async fn latest_ledger(&self) -> AppResult<u32> {
        let root = self
            .get_json("/")
            .await?
            .ok_or_else(|| AppError::ExternalError("horizon root not found".into()))?;
        root["history_latest_ledger"]
            .as_u64()
            .map(|l| l as u32)
            .ok_or_else(|| AppError::ExternalError("horizon root has no history_latest_ledger".into()))
    }

    #[instrument(skip(self))]
    async fn account_sequence(&self, account: &str) -> AppResult<Option<i64>> {
        let Some(body) = self.get_json(&format!("/accounts/{}", account)).await? else {
            return Ok(None);
        };
        let sequence = body["sequence"]
            .as_str()
            .ok_or_else(|| AppError::ExternalError("account record has no sequence".into()))?
            .parse::<i64>()
            .map_err(|_| AppError::ExternalError("invalid sequence number format in account record".into()))?;
        Ok(Some(sequence))
    }

    #[instrument(skip(self, envelope_xdr))]
    async fn submit(&self, envelope_xdr: &str) -> Result<SubmitResult, SubmitFailure> {
        let url = format!("{}/transactions", self.base_url);
        let response = match self.client.post(&url).form(&[("tx", envelope_xdr)]).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(SubmitFailure::Timeout),
            Err(e) => return Err(SubmitFailure::Network(e.to_string())),
        };

        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Err(SubmitFailure::Timeout),
            Err(e) => {
                return Err(SubmitFailure::Rejected(Rejection::http(
                    status.as_u16(),
                    format!("unreadable response: {}", e),
                )))
            }
        };

        if !status.is_success() {
            let rejection = Rejection::from_problem(status.as_u16(), &body);
            warn!(status = status.as_u16(), reason = %rejection.reason(), "transaction rejected");
            return Err(SubmitFailure::Rejected(rejection));
        }

        let hash = body["hash"]
            .as_str()
            .ok_or_else(|| SubmitFailure::Network("no transaction hash in response".into()))?
            .to_string();
        let ledger = body["ledger"].as_u64().unwrap_or_default() as u32;
        debug!(%hash, ledger, "transaction accepted");
        Ok(SubmitResult { hash, ledger })
    }

    #[instrument(skip(self))]
    async fn transaction_status(&self, hash: &str) -> AppResult<Option<OnChainTransaction>> {
        let Some(body) = self.get_json(&format!("/transactions/{}", hash)).await? else {
            return Ok(None);
        };
        Ok(Some(OnChainTransaction {
            hash: body["hash"].as_str().unwrap_or(hash).to_string(),
            ledger: body["ledger"].as_u64().unwrap_or_default() as u32,
            successful: body["successful"].as_bool().unwrap_or(false),
        }))
    }
}
