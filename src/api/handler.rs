use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    accounts::ChannelAccountsService,
    error::{AppError, AppResult, SigningError},
    events::{Message, PAYMENT_COMPLETED_TOPIC, PAYMENT_READY_TOPIC},
    ledger::LedgerTracker,
    store::{
        models::{PaymentStatus, SigningBackend},
        PaymentStore, TransactionStore,
    },
    sync::{CompletionSync, PaymentToSubmitter},
};

#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<dyn PaymentStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub ledger: Arc<LedgerTracker>,
    pub handoff: Arc<PaymentToSubmitter>,
    pub completion: Arc<CompletionSync>,
    /// Present only for the pool backend.
    pub accounts: Option<Arc<ChannelAccountsService>>,
    pub backend: SigningBackend,
}

impl AppState {
    fn accounts(&self) -> AppResult<&ChannelAccountsService> {
        self.accounts
            .as_deref()
            .ok_or_else(|| SigningError::Unsupported(self.backend.to_string()).into())
    }

    /// Queues a payment that just became Ready. The handoff sweep covers failures.
    async fn hand_off(&self, tenant_id: &str, payment_id: Uuid) {
        if let Err(e) = self.handoff.send_ready_payments(tenant_id, &[payment_id]).await {
            warn!(%payment_id, "handoff deferred to sweep: {}", e);
        }
    }
}

/// Health check with the ledger tracker's view
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ledger = state.ledger.status().await;
    let status = if ledger.stale { "degraded" } else { "ok" };
    Json(HealthResponse { status, ledger })
}

/// Platform event ingestion
/// POST /api/v1/events
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(message): Json<Message>,
) -> AppResult<Json<EventResponse>> {
    info!(topic = %message.topic, key = %message.key, tenant_id = %message.tenant_id, "📨 event received");

    let mut response = EventResponse {
        topic: message.topic.clone(),
        queued: Vec::new(),
        synced: 0,
    };
    match message.topic.as_str() {
        PAYMENT_READY_TOPIC => response.queued = state.handoff.handle_event(&message).await?.queued,
        PAYMENT_COMPLETED_TOPIC => response.synced = state.completion.handle_event(&message).await?.synced,
        other => return Err(AppError::InvalidInput(format!("unsupported topic {}", other))),
    }
    Ok(Json(response))
}

/// Failed -> Ready
/// POST /api/v1/payments/:id/retry
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RetryPaymentRequest>,
) -> AppResult<Json<PaymentResponse>> {
    let payment = state.payments.retry_failed(id, &request.user_email).await?;
    info!(payment_id = %id, user = %request.user_email, "🔁 payment retry requested");
    state.hand_off(&payment.tenant_id, payment.id).await;
    Ok(Json(payment.into()))
}

/// Ready -> Paused
/// POST /api/v1/payments/:id/pause
pub async fn pause_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PaymentResponse>> {
    let payment = state
        .payments
        .transition(id, PaymentStatus::Paused, Some("paused by operator".into()), None)
        .await?;
    info!(payment_id = %id, "⏸️ payment paused");
    Ok(Json(payment.into()))
}

/// Paused -> Ready
/// POST /api/v1/payments/:id/resume
pub async fn resume_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PaymentResponse>> {
    let payment = state
        .payments
        .transition(id, PaymentStatus::Ready, Some("resumed by operator".into()), None)
        .await?;
    info!(payment_id = %id, "▶️ payment resumed");
    state.hand_off(&payment.tenant_id, payment.id).await;
    Ok(Json(payment.into()))
}

/// GET /api/v1/transactions/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TransactionResponse>> {
    Ok(Json(state.transactions.get(id).await?.into()))
}

/// Returns a parked row to the queue
/// POST /api/v1/transactions/:id/release
pub async fn release_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TransactionResponse>> {
    state.transactions.release(id).await?;
    info!(tx_id = %id, "parked transaction released");
    Ok(Json(state.transactions.get(id).await?.into()))
}

/// POST /api/v1/accounts/provision
pub async fn provision_accounts(
    State(state): State<AppState>,
    Json(request): Json<ProvisionAccountsRequest>,
) -> AppResult<Json<AccountsResponse>> {
    let accounts = state.accounts()?.create_accounts(request.count).await?;
    Ok(Json(AccountsResponse { accounts }))
}

/// POST /api/v1/accounts/verify
pub async fn verify_accounts(
    State(state): State<AppState>,
    Query(query): Query<VerifyAccountsQuery>,
) -> AppResult<Json<VerifyAccountsResponse>> {
    let report = state.accounts()?.verify_accounts(query.delete_invalid).await?;
    Ok(Json(report.into()))
}

/// DELETE /api/v1/accounts/:public_key
///
/// 409 while the channel account sources an in-flight transaction.
pub async fn delete_account(
    State(state): State<AppState>,
    Path(public_key): Path<String>,
) -> AppResult<Json<AccountsResponse>> {
    state.accounts()?.retire(&public_key).await?;
    Ok(Json(AccountsResponse {
        accounts: vec![public_key],
    }))
}
