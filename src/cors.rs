use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const LOCAL_PREFIXES: &[&str] = &[
    "http://localhost:",
    "https://localhost:",
    "http://127.0.0.1:",
    "https://127.0.0.1:",
];

/// Browser origins allowed to call the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    allow_all: bool,
    origins: Vec<String>,
}

impl OriginPolicy {
    /// Parse a comma-separated allow-list. Only a list that is exactly `*` allows every
    /// origin; otherwise local development origins plus the listed ones are permitted.
    pub fn from_list(raw: &str) -> Self {
        let origins: Vec<String> = raw
            .split(',')
            .map(normalize)
            .filter(|origin| !origin.is_empty())
            .collect();
        let allow_all = matches!(origins.as_slice(), [only] if only == "*");
        Self { allow_all, origins }
    }

    pub fn is_permitted(&self, origin: &str) -> bool {
        if self.allow_all {
            return true;
        }
        let origin = normalize(origin);
        if origin.is_empty() {
            return false;
        }
        LOCAL_PREFIXES.iter().any(|prefix| origin.starts_with(prefix))
            || self.origins.iter().any(|allowed| *allowed == origin)
    }

    pub fn layer(&self) -> CorsLayer {
        let policy = self.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                origin
                    .to_str()
                    .map(|origin| policy.is_permitted(origin))
                    .unwrap_or(false)
            }))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                HeaderName::from_static("x-client-info"),
                HeaderName::from_static("apikey"),
                HeaderName::from_static("x-api-key"),
                HeaderName::from_static("x-admin-key"),
                header::CONTENT_TYPE,
            ])
            .expose_headers([
                HeaderName::from_static("x-ratelimit-limit"),
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderName::from_static("x-ratelimit-reset"),
                header::RETRY_AFTER,
            ])
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
