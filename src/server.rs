use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        handler::{
            delete_account, get_transaction, health_check, ingest_event, pause_payment, provision_accounts,
            release_transaction, resume_payment, retry_payment, verify_accounts, AppState,
        },
        models::{ProvisionAccountsRequest, RetryPaymentRequest},
    },
    error::{AppError, AppResult},
    middleware::{rate_limit_middleware, validate_json, RateLimitLayer},
    shutdown::ShutdownSignal,
};

pub fn create_app(state: AppState, rate_limit: RateLimitLayer) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // operator actions change payment or account state
    let mutating = Router::new()
        .route(
            "/payments/:id/retry",
            post(retry_payment).layer(from_fn(validate_json::<RetryPaymentRequest>)),
        )
        .route("/payments/:id/pause", post(pause_payment))
        .route("/payments/:id/resume", post(resume_payment))
        .route("/transactions/:id/release", post(release_transaction))
        .route(
            "/accounts/provision",
            post(provision_accounts).layer(from_fn(validate_json::<ProvisionAccountsRequest>)),
        )
        .route("/accounts/verify", post(verify_accounts))
        .route("/accounts/:public_key", delete(delete_account))
        .route_layer(from_fn_with_state(rate_limit, rate_limit_middleware));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                .route("/events", post(ingest_event))
                .route("/transactions/:id", get(get_transaction))
                .merge(mutating),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str, shutdown: ShutdownSignal) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Fatal(format!("binding {}: {}", bind_address, e)))?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Internal(format!("server error: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerTracker;
    use crate::network::mock::MockNetwork;
    use crate::signing::resolver::DistributionAccountResolver;
    use crate::store::memory::{MemoryPaymentStore, MemoryTssStore};
    use crate::store::models::{NewSubmissionTransaction, Payment, PaymentStatus, SigningBackend, TransactionStatus};
    use crate::store::{PaymentStore, TransactionStore};
    use crate::sync::{CompletionSync, PaymentToSubmitter};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: Arc<MemoryTssStore>,
        payments: Arc<MemoryPaymentStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryTssStore::new());
        let payments = Arc::new(MemoryPaymentStore::new());
        let network = Arc::new(MockNetwork::at_ledger(77));
        let resolver = Arc::new(DistributionAccountResolver::fixed(SigningBackend::Env, "GDIST"));
        let state = AppState {
            payments: payments.clone(),
            transactions: store.clone(),
            ledger: Arc::new(LedgerTracker::new(
                network,
                Duration::from_secs(5),
                Duration::from_secs(1),
                Duration::from_millis(200),
            )),
            handoff: Arc::new(PaymentToSubmitter::new(payments.clone(), store.clone(), resolver, 10)),
            completion: Arc::new(CompletionSync::new(store.clone(), payments.clone(), 10)),
            accounts: None,
            backend: SigningBackend::Env,
        };
        Harness {
            app: create_app(state, RateLimitLayer::new(100, 60)),
            store,
            payments,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn payment(payments: &MemoryPaymentStore, path: &[PaymentStatus]) -> Payment {
        let mut payment = Payment::draft("tenant", "3", "XLM", None, "GDEST");
        for status in path {
            payment.transition(*status, None).unwrap();
        }
        payments.insert(payment).await.unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_ledger() {
        let h = harness();
        let (status, body) = call(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        // nothing has refreshed the tracker yet
        assert_eq!(body["status"], "degraded");
        assert!(body["ledger"]["latest_ledger"].is_null());
    }

    #[tokio::test]
    async fn test_ready_event_queues_submission() {
        let h = harness();
        let ready = payment(&h.payments, &[PaymentStatus::Ready]).await;
        let event = json!({
            "topic": "payment_ready",
            "key": ready.id,
            "tenant_id": "tenant",
            "type": "payment_ready",
            "data": { "payment_ids": [ready.id] }
        });

        let (status, body) = call(&h.app, "POST", "/api/v1/events", Some(event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queued"][0], ready.id.to_string());
        assert!(h.store.find_unsynced_for_payment(ready.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_topic_is_bad_request() {
        let h = harness();
        let event = json!({ "topic": "x", "key": "k", "tenant_id": "t", "type": "x", "data": {} });
        let (status, body) = call(&h.app, "POST", "/api/v1/events", Some(event)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_retry_validates_email() {
        let h = harness();
        let failed = payment(
            &h.payments,
            &[PaymentStatus::Ready, PaymentStatus::Pending, PaymentStatus::Failed],
        )
        .await;
        let uri = format!("/api/v1/payments/{}/retry", failed.id);

        let (status, _) = call(&h.app, "POST", &uri, Some(json!({ "user_email": "nope" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h.app, "POST", &uri, Some(json!({ "user_email": "ops@example.org" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "READY");
        // retried payments are queued right away
        assert!(h.store.find_unsynced_for_payment(failed.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pause_pending_payment_conflicts() {
        let h = harness();
        let pending = payment(&h.payments, &[PaymentStatus::Ready, PaymentStatus::Pending]).await;
        let (status, body) = call(&h.app, "POST", &format!("/api/v1/payments/{}/pause", pending.id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["details"]["from"], "PENDING");
        assert_eq!(body["details"]["to"], "PAUSED");
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness();
        let ready = payment(&h.payments, &[PaymentStatus::Ready]).await;
        let (status, body) = call(&h.app, "POST", &format!("/api/v1/payments/{}/pause", ready.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "PAUSED");

        let (status, body) = call(&h.app, "POST", &format!("/api/v1/payments/{}/resume", ready.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "READY");
    }

    #[tokio::test]
    async fn test_release_parked_transaction() {
        let h = harness();
        let ready = payment(&h.payments, &[PaymentStatus::Ready]).await;
        let row = h
            .store
            .insert(NewSubmissionTransaction::for_payment(&ready, "GDIST"))
            .await
            .unwrap();
        h.store.claim_batch(1, Duration::from_secs(60)).await.unwrap();
        h.store.park(row.id, "signer refused".into()).await.unwrap();

        let (_, body) = call(&h.app, "GET", &format!("/api/v1/transactions/{}", row.id), None).await;
        assert_eq!(body["parked"], true);

        let (status, body) = call(&h.app, "POST", &format!("/api/v1/transactions/{}/release", row.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["parked"], false);
        assert_eq!(h.store.get(row.id).await.unwrap().status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_account_routes_need_pool_backend() {
        let h = harness();
        let (status, body) = call(&h.app, "POST", "/api/v1/accounts/provision", Some(json!({ "count": 2 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "UNSUPPORTED_OPERATION");

        let (status, _) = call(&h.app, "POST", "/api/v1/accounts/provision", Some(json!({ "count": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_transaction_is_not_found() {
        let h = harness();
        let (status, _) = call(&h.app, "GET", &format!("/api/v1/transactions/{}", uuid::Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
