use serde_json::Value;

/// Transaction-level codes that will never succeed on resubmission.
const TERMINAL_TX_CODES: &[&str] = &[
    "tx_bad_auth",
    "tx_bad_auth_extra",
    "tx_insufficient_balance",
    "tx_malformed",
    "tx_no_source_account",
];

/// Operation-level codes that will never succeed on resubmission.
const TERMINAL_OP_CODES: &[&str] = &[
    "op_bad_auth",
    "op_underfunded",
    "op_src_not_authorized",
    "op_no_destination",
    "op_no_trust",
    "op_line_full",
    "op_not_authorized",
    "op_no_issuer",
    "op_malformed",
    "op_low_reserve",
];

/// The destination exists but cannot hold the asset yet.
const DESTINATION_NOT_READY_CODES: &[&str] = &[
    "op_no_destination",
    "op_no_trust",
    "op_line_full",
    "op_not_authorized",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionClass {
    /// Write Failed, do not retry.
    Terminal,
    /// Resubmit the same sequence number wrapped in a fee-bump.
    FeeTooLow,
    /// Sequence moved on; rebuild.
    BadSequence,
    /// Outside its time or ledger bounds; rebuild.
    Expired,
    RateLimited,
    Transient,
}

/// Structured rejection from the submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub http_status: u16,
    pub tx_code: Option<String>,
    pub op_codes: Vec<String>,
    pub detail: String,
}

impl Rejection {
    pub fn http(status: u16, detail: impl Into<String>) -> Self {
        Self {
            http_status: status,
            tx_code: None,
            op_codes: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn with_codes(status: u16, tx_code: &str, op_codes: &[&str]) -> Self {
        Self {
            http_status: status,
            tx_code: Some(tx_code.to_string()),
            op_codes: op_codes.iter().map(|c| c.to_string()).collect(),
            detail: String::new(),
        }
    }

    /// Parses a Horizon problem document.
    pub fn from_problem(status: u16, body: &Value) -> Self {
        let codes = &body["extras"]["result_codes"];
        let tx_code = codes["transaction"].as_str().map(str::to_string);
        let op_codes = codes["operations"]
            .as_array()
            .map(|ops| ops.iter().filter_map(|op| op.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let detail = body["detail"]
            .as_str()
            .or_else(|| body["title"].as_str())
            .unwrap_or_default()
            .to_string();
        Self {
            http_status: status,
            tx_code,
            op_codes,
            detail,
        }
    }

    fn has_tx_code(&self, codes: &[&str]) -> bool {
        self.tx_code.as_deref().map_or(false, |c| codes.contains(&c))
    }

    fn has_op_code(&self, codes: &[&str]) -> bool {
        self.op_codes.iter().any(|c| codes.contains(&c.as_str()))
    }

    pub fn classify(&self) -> RejectionClass {
        match self.http_status {
            429 => return RejectionClass::RateLimited,
            500..=599 => return RejectionClass::Transient,
            _ => {}
        }

        match self.tx_code.as_deref() {
            Some("tx_insufficient_fee") => RejectionClass::FeeTooLow,
            Some("tx_bad_seq") => RejectionClass::BadSequence,
            Some("tx_too_late") | Some("tx_too_early") => RejectionClass::Expired,
            _ if self.has_tx_code(TERMINAL_TX_CODES) => RejectionClass::Terminal,
            Some("tx_failed") if self.has_op_code(TERMINAL_OP_CODES) => RejectionClass::Terminal,
            _ => RejectionClass::Transient,
        }
    }

    /// Responses that say nothing definite about the network's state. They
    /// shrink the processing limiter's batch size.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self.http_status, 429 | 504) || self.tx_code.as_deref() == Some("tx_insufficient_fee")
    }

    pub fn destination_not_ready(&self) -> bool {
        self.has_op_code(DESTINATION_NOT_READY_CODES)
    }

    /// The most specific code available.
    pub fn code(&self) -> String {
        self.op_codes
            .iter()
            .find(|c| TERMINAL_OP_CODES.contains(&c.as_str()))
            .cloned()
            .or_else(|| self.tx_code.clone())
            .unwrap_or_else(|| format!("http_{}", self.http_status))
    }

    pub fn reason(&self) -> String {
        let mut parts = vec![format!("status {}", self.http_status)];
        if let Some(tx) = &self.tx_code {
            parts.push(format!("transaction: {}", tx));
        }
        if !self.op_codes.is_empty() {
            parts.push(format!("operations: {}", self.op_codes.join(", ")));
        }
        if !self.detail.is_empty() {
            parts.push(self.detail.clone());
        }
        if self.destination_not_ready() {
            parts.push("destination cannot receive the asset".into());
        }
        parts.join("; ")
    }
}
