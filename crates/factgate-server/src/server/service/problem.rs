//! `application/problem+json` error responses.

use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use factgate::Rejection;
use serde::Serialize;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: &'static str,
    pub status: u16,
    pub detail: String,
    pub trace_id: String,
}

impl Problem {
    pub fn new(status: StatusCode, detail: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            kind: "about:blank",
            title: status.canonical_reason().unwrap_or("Error"),
            status: status.as_u16(),
            detail: detail.into(),
            trace_id: trace_id.into(),
        }
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match serde_json::to_string(&self) {
            Ok(body) => (status, [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)], body).into_response(),
            Err(_) => status.into_response(),
        }
    }
}

/// Sets the `X-RateLimit-*` headers.
pub fn set_rate_limit_headers(headers: &mut HeaderMap, limit: u64, remaining: u64) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
}

/// The 429 returned for a request denied by admission control.
pub fn too_many_requests(rejection: &Rejection, trace_id: String) -> Response {
    let mut response =
        Problem::new(StatusCode::TOO_MANY_REQUESTS, "Request rate limit exceeded", trace_id).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(rejection.retry_after));
    set_rate_limit_headers(headers, rejection.limit, rejection.remaining);
    response
}
