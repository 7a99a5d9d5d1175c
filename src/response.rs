use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::bucket::Decision;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body of a 429 rejection.
#[derive(Debug, Serialize)]
pub struct RateLimitedResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
    pub remaining: u32,
    pub reset_in_ms: u64,
}

impl RateLimitedResponse {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            error: "rate_limit_exceeded".to_string(),
            message: "Rate limit exceeded".to_string(),
            code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            remaining: decision.remaining,
            reset_in_ms: decision.reset_in_ms,
        }
    }
}

/// Add `X-RateLimit-*` headers, plus `Retry-After` on a denial.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_in_ms));
    if !decision.allowed {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
    }
}

/// 429 with retry hints for a denied decision.
pub fn rejection(decision: &Decision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitedResponse::from_decision(decision)),
    )
        .into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
}

/// 200 with the decision body when allowed, otherwise [`rejection`].
pub fn decision_response(decision: &Decision) -> Response {
    if !decision.allowed {
        return rejection(decision);
    }
    let mut response = Json(decision).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool) -> Decision {
        Decision {
            allowed,
            remaining: if allowed { 4 } else { 0 },
            reset_in_ms: 2_500,
            limit: 5,
            degraded: false,
        }
    }

    #[test]
    fn test_allowed_response_headers() {
        let response = decision_response(&decision(true));
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "5");
        assert_eq!(headers["x-ratelimit-remaining"], "4");
        assert_eq!(headers["x-ratelimit-reset"], "2500");
        assert!(headers.get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_denied_response_has_retry_after() {
        let response = decision_response(&decision(false));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }
}
