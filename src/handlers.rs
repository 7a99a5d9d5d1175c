use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::bucket::{BucketState, Decision};
use crate::controller::AdmissionController;
use crate::cors::OriginPolicy;
use crate::error::AdmissionError;
use crate::health::HealthChecker;
use crate::key_generator::KeyGenerator;
use crate::metrics::{AdmissionMetrics, MetricsCollector};
use crate::middleware::{authorize_admin, GateState};
use crate::policy::PolicyTable;
use crate::response::{apply_rate_limit_headers, decision_response};
use crate::validation::{validate_key, CheckRequest};

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AdmissionController>,
    pub policies: Arc<PolicyTable>,
    pub keys: Arc<KeyGenerator>,
    pub metrics: MetricsCollector,
    pub health: HealthChecker,
    pub origins: OriginPolicy,
    /// Secret for admin operations; `None` disables them.
    pub admin_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        controller: Arc<AdmissionController>,
        policies: PolicyTable,
        keys: KeyGenerator,
    ) -> Self {
        Self {
            health: HealthChecker::new(controller.clone()),
            controller,
            policies: Arc::new(policies),
            keys: Arc::new(keys),
            metrics: MetricsCollector::new(),
            origins: OriginPolicy::from_list("*"),
            admin_key: None,
        }
    }

    pub fn with_admin_key(mut self, admin_key: Option<String>) -> Self {
        self.admin_key = admin_key.filter(|key| !key.is_empty()).map(Arc::from);
        self
    }

    pub fn with_origins(mut self, origins: OriginPolicy) -> Self {
        self.origins = origins;
        self
    }

    /// State for gating routes with the named policy.
    pub fn gate(&self, policy: &str) -> GateState {
        GateState {
            app: self.clone(),
            policy: Arc::from(policy),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BucketResponse {
    pub policy: String,
    pub key: String,
    pub state: BucketState,
    #[serde(flatten)]
    pub decision: Decision,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: String,
    pub message: String,
    pub policy: String,
    pub key: String,
    pub existed: bool,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub global: AdmissionMetrics,
    pub policies: BTreeMap<String, AdmissionMetrics>,
    pub store: String,
    pub buckets: Option<usize>,
    pub fallback_decisions: u64,
}

/// Consume one token for the caller under a named policy.
///
/// Checking under an explicit `key` from the body acts on another caller's bucket and
/// requires the admin key.
pub async fn check_admission(
    State(state): State<AppState>,
    Path(policy_name): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AdmissionError> {
    let policy = state.policies.require(&policy_name)?;
    let request = CheckRequest::from_body(&body)?;

    let key = match request.key {
        Some(key) => {
            authorize_admin(state.admin_key.as_deref(), &headers)?;
            key
        }
        None => state
            .keys
            .generate_key(&headers, peer.map(|ConnectInfo(addr)| addr))?,
    };

    let decision = state.controller.check_and_consume(&key, &policy).await?;
    state.metrics.record_decision(&policy_name, &decision).await;

    if !decision.allowed {
        info!(policy = %policy_name, key = %key, reset_in_ms = decision.reset_in_ms, "rate limit exceeded");
    }

    Ok(decision_response(&decision))
}

/// Inspect a bucket without consuming a token
pub async fn get_bucket(
    State(state): State<AppState>,
    Path((policy_name, key)): Path<(String, String)>,
) -> Result<Response, AdmissionError> {
    let policy = state.policies.require(&policy_name)?;
    validate_key(&key)?;

    let decision = state.controller.peek(&key, &policy).await?;
    let mut response = Json(BucketResponse {
        policy: policy_name,
        key,
        state: decision.state(),
        decision,
    })
    .into_response();
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

/// Drop a bucket so the caller starts again at full capacity
pub async fn reset_bucket(
    State(state): State<AppState>,
    Path((policy_name, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ResetResponse>, AdmissionError> {
    authorize_admin(state.admin_key.as_deref(), &headers)?;
    let policy = state.policies.require(&policy_name)?;
    validate_key(&key)?;

    let existed = state.controller.reset(&key, &policy).await?;
    info!(policy = %policy_name, key = %key, existed, "bucket reset");

    Ok(Json(ResetResponse {
        status: "success".to_string(),
        message: "Bucket reset".to_string(),
        policy: policy_name,
        key,
        existed,
    }))
}

pub async fn list_policies(State(state): State<AppState>) -> Json<PolicyTable> {
    Json(state.policies.as_ref().clone())
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        global: state.metrics.get_global_metrics().await,
        policies: state.metrics.get_all_metrics().await,
        store: state.controller.store().name().to_string(),
        buckets: state.controller.store().len(),
        fallback_decisions: state.controller.fallback_count(),
    })
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.health.check_store().await;

    if store.is_healthy() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": store.backend,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": store.backend,
                "error": store.error,
            })),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use crate::middleware::ADMIN_KEY_HEADER;
    use crate::policy::Policy;
    use crate::server::create_app;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    pub(crate) fn test_state() -> AppState {
        let controller = Arc::new(AdmissionController::new(
            Arc::new(MemoryStore::default()),
            ControllerSettings::default(),
        ));
        let mut policies = PolicyTable::defaults().unwrap();
        policies.insert("tiny", Policy::new(Duration::from_secs(60), 2).unwrap());
        AppState::new(controller, policies, KeyGenerator::default())
            .with_admin_key(Some(ADMIN_KEY.to_string()))
    }

    const ADMIN_KEY: &str = "test-admin-key";

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn check(policy: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/rate-limit/{}/check", policy))
            .header("content-type", "application/json")
            .header(ADMIN_KEY_HEADER, ADMIN_KEY)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_until_rejected() {
        let app = create_app(test_state());

        let response = app.clone().oneshot(check("tiny", r#"{"key":"ip:1.2.3.4"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        let body = json_body(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 1);
        assert_eq!(body["degraded"], false);

        app.clone().oneshot(check("tiny", r#"{"key":"ip:1.2.3.4"}"#)).await.unwrap();

        let response = app.oneshot(check("tiny", r#"{"key":"ip:1.2.3.4"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        let body = json_body(response).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["remaining"], 0);
        assert!(body["reset_in_ms"].as_u64().unwrap() <= 60_000);
    }

    #[tokio::test]
    async fn test_check_derives_key_from_headers() {
        let app = create_app(test_state());
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/rate-limit/tiny/check")
                .header("x-forwarded-for", "198.51.100.4")
                .body(Body::empty())
                .unwrap()
        };

        app.clone().oneshot(request()).await.unwrap();
        app.clone().oneshot(request()).await.unwrap();
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let peek = app
            .oneshot(
                Request::builder()
                    .uri("/rate-limit/tiny/buckets/ip:198.51.100.4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(peek).await;
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["allowed"], false);
        assert_eq!(body["state"], "exhausted");
    }

    #[tokio::test]
    async fn test_peek_reports_active_state() {
        let app = create_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/rate-limit/tiny/buckets/ip:203.0.113.77")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["state"], "active");
        assert_eq!(body["remaining"], 2);
    }

    #[tokio::test]
    async fn test_oversized_header_identity_is_bad_request() {
        let state = test_state();
        let app = create_app(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rate-limit/tiny/check")
                    .header("x-forwarded-for", "9".repeat(300))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.controller.store().len(), Some(0));
    }

    #[tokio::test]
    async fn test_explicit_key_check_requires_admin_key() {
        let app = create_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rate-limit/tiny/check")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"key":"ip:1.2.3.4"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_reset_without_admin_key_is_unauthorized() {
        let state = test_state();
        let app = create_app(state.clone());
        for _ in 0..2 {
            app.clone().oneshot(check("tiny", r#"{"key":"ip:10.1.1.1"}"#)).await.unwrap();
        }

        let delete = |admin_key: Option<&'static str>| {
            let mut builder = Request::builder()
                .method("DELETE")
                .uri("/rate-limit/tiny/buckets/ip:10.1.1.1");
            if let Some(admin_key) = admin_key {
                builder = builder.header(ADMIN_KEY_HEADER, admin_key);
            }
            builder.body(Body::empty()).unwrap()
        };

        let response = app.clone().oneshot(delete(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.clone().oneshot(delete(Some("guess"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // still exhausted
        let response = app.oneshot(check("tiny", r#"{"key":"ip:10.1.1.1"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_reset_disabled_without_configured_admin_key() {
        let app = create_app(test_state().with_admin_key(None));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/rate-limit/tiny/buckets/ip:10.1.1.1")
                    .header(ADMIN_KEY_HEADER, ADMIN_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let app = create_app(test_state());
        let response = app.oneshot(check("nope", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_invalid_body_is_unprocessable() {
        let app = create_app(test_state());
        let response = app.oneshot(check("tiny", r#"{"key":"bad key"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_reset_bucket() {
        let app = create_app(test_state());
        for _ in 0..2 {
            app.clone().oneshot(check("tiny", r#"{"key":"user:42"}"#)).await.unwrap();
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/rate-limit/tiny/buckets/user:42")
                    .header(ADMIN_KEY_HEADER, ADMIN_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["existed"], true);

        let response = app.oneshot(check("tiny", r#"{"key":"user:42"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_policies_metrics_health_ready() {
        let app = create_app(test_state());
        app.clone().oneshot(check("cascade-risk", r#"{"key":"ip:9.9.9.9"}"#)).await.unwrap();

        let get = |uri: &'static str| Request::builder().uri(uri).body(Body::empty()).unwrap();

        let policies = json_body(app.clone().oneshot(get("/policies")).await.unwrap()).await;
        assert_eq!(policies["record-outcome"]["capacity"], 15);
        assert_eq!(policies["tiny"]["window"], "1m");

        let metrics = json_body(app.clone().oneshot(get("/metrics")).await.unwrap()).await;
        assert_eq!(metrics["global"]["total_requests"], 1);
        assert_eq!(metrics["policies"]["cascade-risk"]["allowed_requests"], 1);
        assert_eq!(metrics["store"], "memory");
        assert_eq!(metrics["buckets"], 1);

        let health = json_body(app.clone().oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(health["status"], "healthy");

        let ready = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
    }
}
