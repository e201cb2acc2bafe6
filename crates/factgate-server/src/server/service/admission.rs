//! Admission-control middleware for HTTP routes.
//!
//! Each request is charged one token from every enabled quota of its
//! identity (API key, peer address, organization). Admitted responses carry
//! `X-RateLimit-Limit` / `X-RateLimit-Remaining`; denied requests get a 429
//! problem body with `Retry-After` and never reach the handler.

use crate::server::{
    service::{
        handler::{AppState, RequestId, client_ip},
        problem::{set_rate_limit_headers, too_many_requests},
    },
    telemetry::{increment_rejections, increment_requests},
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use factgate::Error;

pub async fn admit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identity = state.identity(request.headers(), &client_ip(request.extensions()));

    match state.limiter.check_and_consume(&identity).await {
        Ok(admission) => {
            increment_requests();
            let mut response = next.run(request).await;
            set_rate_limit_headers(response.headers_mut(), admission.limit, admission.remaining);
            response
        }
        Err(Error::QuotaExceeded(rejection)) => {
            increment_rejections(&rejection.denied);
            #[cfg(feature = "tracing")]
            tracing::info!(
                path = %request.uri().path(),
                denied = ?rejection.denied,
                retry_after = rejection.retry_after,
                "rate limit exceeded"
            );
            too_many_requests(&rejection, RequestId::of(request.extensions()))
        }
        Err(_e) => {
            // Store faults are absorbed by the limiter; anything else admits.
            #[cfg(feature = "tracing")]
            tracing::error!("admission check failed: {_e}");
            next.run(request).await
        }
    }
}
