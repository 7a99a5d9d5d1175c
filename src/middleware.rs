use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AdmissionError;
use crate::handlers::AppState;
use crate::key_generator::KeyGenerator;
use crate::response::{apply_rate_limit_headers, rejection};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Require the configured admin key in `x-admin-key`.
///
/// Operations that act on someone else's bucket (resetting it, or checking under an
/// explicit identity) are refused outright when no admin key is configured.
pub fn authorize_admin(admin_key: Option<&str>, headers: &HeaderMap) -> Result<(), AdmissionError> {
    let Some(expected) = admin_key else {
        warn!("admin operation refused: no admin key configured");
        return Err(AdmissionError::Unauthorized(
            "admin operations are disabled".to_string(),
        ));
    };
    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AdmissionError::Unauthorized(format!(
            "missing or invalid {} header",
            ADMIN_KEY_HEADER
        )))
    }
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = KeyGenerator::extract_client_ip(request.headers(), peer_addr(&request));
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        target: "admission::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        request_id = %request_id,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "admission::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        request_id = %request_id,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// State for [`admission_gate`]: the app plus the policy the gated routes run under.
#[derive(Clone)]
pub struct GateState {
    pub app: AppState,
    pub policy: Arc<str>,
}

/// Admit or reject a request before it reaches the wrapped handler.
///
/// ```ignore
/// let router = Router::new()
///     .route("/calculate-apo", post(calculate_apo))
///     .layer(middleware::from_fn_with_state(state.gate("calculate-apo"), admission_gate));
/// ```
pub async fn admission_gate(
    State(gate): State<GateState>,
    request: Request,
    next: Next,
) -> Response {
    let policy = match gate.app.policies.require(&gate.policy) {
        Ok(policy) => policy,
        Err(e) => return e.into_response(),
    };
    let identity = match gate
        .app
        .keys
        .generate_key(request.headers(), peer_addr(&request))
    {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let decision = match gate.app.controller.check_and_consume(&identity, &policy).await {
        Ok(decision) => decision,
        Err(e) => return e.into_response(),
    };
    gate.app.metrics.record_decision(&gate.policy, &decision).await;

    if !decision.allowed {
        info!(
            policy = %gate.policy,
            key = %identity,
            reset_in_ms = decision.reset_in_ms,
            "request rejected by admission gate"
        );
        return rejection(&decision);
    }

    debug!(policy = %gate.policy, key = %identity, remaining = decision.remaining, "request admitted");
    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

pub(crate) fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}
