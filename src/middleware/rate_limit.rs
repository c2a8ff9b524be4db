use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Process-wide limit for mutating operator routes.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, governor::clock::DefaultClock>>,
}

impl RateLimitLayer {
    /// `requests` per `per_seconds`, allowing the whole allowance as a burst.
    pub fn new(requests: u32, per_seconds: u64) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let period = Duration::from_secs(per_seconds.max(1)) / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn check(&self) -> Result<(), Response> {
        self.limiter.check().map_err(|_| {
            warn!("rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please try again later.",
            )
                .into_response()
        })
    }
}

pub async fn rate_limit_middleware(
    State(limit): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limit.check()?;
    Ok(next.run(req).await)
}
