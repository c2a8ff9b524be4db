use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use validator::Validate;

/// Operator request bodies are small.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Validation error: {0}")]
    InvalidInput(String),
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ValidationError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = serde_json::json!({
            "error": error_message,
            "error_code": "VALIDATION_FAILED",
        });

        (status, Json(body)).into_response()
    }
}

/// Rejects the request unless its body parses as `T` and passes `T`'s validation rules.
pub async fn validate_json<T: DeserializeOwned + Validate>(
    req: Request,
    next: Next,
) -> Result<Response, ValidationError> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ValidationError::InvalidInput("Invalid request body".to_string()))?;

    let value: T = serde_json::from_slice(&bytes)
        .map_err(|e| ValidationError::InvalidInput(format!("Invalid JSON: {}", e)))?;

    value.validate().map_err(|e| {
        let mut errors = e
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let error_messages: Vec<String> = errors
                    .iter()
                    .map(|e| e.message.as_ref().map(|s| s.to_string()).unwrap_or_default())
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<String>>();
        errors.sort();

        ValidationError::InvalidInput(format!("Validation failed: {}", errors.join("; ")))
    })?;

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}
