use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire service
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup validation failed; the process must not start.
    #[error("Fatal startup error: {0}")]
    Fatal(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Outcome classes of a network submission that did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// Retried on a later claim cycle. Never surfaced as a payment failure.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Written as Failed with the reason preserved. Not retried automatically.
    #[error("Rejected by network: {reason}")]
    TerminalRejection { code: String, reason: String },

    #[error("Ledger tracker has never refreshed successfully")]
    LedgerUnavailable,

    #[error("Ledger window expired: max ledger {max_ledger} < current ledger {current}")]
    WindowExpired { max_ledger: u32, current: u32 },

    #[error("Network call timed out after {0}ms")]
    Timeout(u64),
}

/// Signature Service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Not authorized to sign for account {0}")]
    Unauthorized(String),

    #[error("Operation not supported by the {0} signing backend")]
    Unsupported(String),

    #[error("Custody backend timed out")]
    CustodyTimeout,

    #[error("Custody backend rejected the request: {0}")]
    CustodyRejected(String),

    #[error("Custody backend unavailable: {0}")]
    CustodyUnavailable(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("No source accounts supplied")]
    NoAccounts,
}

/// Invariant violations. Callers treat these as programming errors upstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Expected {expected} rows to be marked synced, updated {updated}")]
    SyncMismatch { expected: usize, updated: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflicting concurrent update: {0}")]
    Conflict(String),
}

impl AppError {
    /// Only explicit terminal rejections become Failed payments.
    pub fn is_terminal_rejection(&self) -> bool {
        matches!(
            self,
            AppError::Submission(SubmissionError::TerminalRejection { .. })
                | AppError::Signing(SigningError::CustodyRejected(_))
        )
    }

    /// Configuration or security errors: fail closed, do not retry.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            AppError::Signing(SigningError::Unauthorized(_))
                | AppError::Signing(SigningError::Unsupported(_))
                | AppError::Signing(SigningError::InvalidKey(_))
                | AppError::Signing(SigningError::NoAccounts)
        )
    }

    /// Errors that leave the row pending for a later claim cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Submission(SubmissionError::Transient(_))
                | AppError::Submission(SubmissionError::LedgerUnavailable)
                | AppError::Submission(SubmissionError::WindowExpired { .. })
                | AppError::Submission(SubmissionError::Timeout(_))
                | AppError::Signing(SigningError::CustodyTimeout)
                | AppError::Signing(SigningError::CustodyUnavailable(_))
                | AppError::Database(_)
                | AppError::ExternalError(_)
                | AppError::Cancelled
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Store(StoreError::NotFound(_)))
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Store(StoreError::NotFound(what)) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::Store(StoreError::InvalidArgument(msg)) | AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg,
                None,
            ),
            AppError::Store(StoreError::Conflict(msg)) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                msg,
                None,
            ),
            AppError::State(StateError::InvalidTransition { from, to }) => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                format!("Invalid transition from {} to {}", from, to),
                Some(serde_json::json!({ "from": from, "to": to })),
            ),
            AppError::Signing(SigningError::Unsupported(backend)) => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_OPERATION",
                format!("Operation not supported by the {} signing backend", backend),
                Some(serde_json::json!({ "backend": backend })),
            ),
            AppError::Signing(SigningError::Unauthorized(account)) => (
                StatusCode::FORBIDDEN,
                "SIGNING_UNAUTHORIZED",
                format!("Not authorized to sign for account {}", account),
                None,
            ),
            AppError::Submission(SubmissionError::LedgerUnavailable) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "LEDGER_UNAVAILABLE",
                "Ledger tracker has not refreshed yet".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return AppError::Submission(SubmissionError::Transient(format!(
                "HTTP request timed out: {}",
                error
            )));
        }
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Fatal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<stellar_xdr::curr::Error> for AppError {
    fn from(error: stellar_xdr::curr::Error) -> Self {
        AppError::Internal(format!("XDR error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {}", error))
    }
}

/// Result type alias for the service
pub type AppResult<T> = Result<T, AppError>;
