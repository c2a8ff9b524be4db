use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::error::{AppResult, SubmissionError};
use crate::network::horizon::{NetworkClient, OnChainTransaction, SubmitFailure, SubmitResult};

#[derive(Default)]
struct MockState {
    ledger: Option<u32>,
    sequences: HashMap<String, i64>,
    responses: VecDeque<Result<SubmitResult, SubmitFailure>>,
    submitted: Vec<String>,
    on_chain: HashMap<String, OnChainTransaction>,
    ledger_calls: usize,
    status_calls: usize,
}

/// Scriptable network for tests. Submissions succeed unless a response is queued.
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<MockState>,
}

impl MockNetwork {
    pub fn at_ledger(ledger: u32) -> Self {
        let network = Self::default();
        network.set_ledger(Some(ledger));
        network
    }

    /// `None` makes ledger queries fail.
    pub fn set_ledger(&self, ledger: Option<u32>) {
        self.state.lock().ledger = ledger;
    }

    pub fn set_sequence(&self, account: &str, sequence: i64) {
        self.state.lock().sequences.insert(account.to_string(), sequence);
    }

    pub fn push_response(&self, response: Result<SubmitResult, SubmitFailure>) {
        self.state.lock().responses.push_back(response);
    }

    pub fn record_on_chain(&self, hash: &str, ledger: u32, successful: bool) {
        self.state.lock().on_chain.insert(
            hash.to_string(),
            OnChainTransaction {
                hash: hash.to_string(),
                ledger,
                successful,
            },
        );
    }

    /// Envelopes received by `submit`, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().submitted.clone()
    }

    pub fn ledger_calls(&self) -> usize {
        self.state.lock().ledger_calls
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().status_calls
    }
}

#[async_trait]
impl NetworkClient for MockNetwork {
    async fn latest_ledger(&self) -> AppResult<u32> {
        let mut state = self.state.lock();
        state.ledger_calls += 1;
        state
            .ledger
            .ok_or_else(|| SubmissionError::Transient("ledger unavailable".into()).into())
    }

    async fn account_sequence(&self, account: &str) -> AppResult<Option<i64>> {
        Ok(self.state.lock().sequences.get(account).copied())
    }

    async fn submit(&self, envelope_xdr: &str) -> Result<SubmitResult, SubmitFailure> {
        let mut state = self.state.lock();
        state.submitted.push(envelope_xdr.to_string());
        let count = state.submitted.len();
        let ledger = state.ledger.unwrap_or_default();
        state.responses.pop_front().unwrap_or_else(|| {
            Ok(SubmitResult {
                hash: format!("mock-{}", count),
                ledger,
            })
        })
    }

    async fn transaction_status(&self, hash: &str) -> AppResult<Option<OnChainTransaction>> {
        let mut state = self.state.lock();
        state.status_calls += 1;
        Ok(state.on_chain.get(hash).cloned())
    }
}
