use crate::config::{Config, StoreKind};
use crate::controller::AdmissionController;
use crate::cors::OriginPolicy;
use crate::error::AdmissionError;
use crate::handlers::{
    check_admission, get_bucket, health_check, list_policies, metrics, readiness_check,
    reset_bucket, AppState,
};
use crate::key_generator::KeyGenerator;
use crate::middleware::logging_middleware;
use crate::policy::PolicyTable;
use crate::store::{BucketStore, MemoryStore, RedisStore};
use crate::sweeper::Sweeper;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Build the router for `state`.
pub fn create_app(state: AppState) -> Router {
    let cors = state.origins.layer();

    Router::new()
        .route("/rate-limit/:policy/check", post(check_admission))
        .route(
            "/rate-limit/:policy/buckets/:key",
            get(get_bucket).delete(reset_bucket),
        )
        .route("/policies", get(list_policies))
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    controller: Arc<AdmissionController>,
    sweep_interval: Duration,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, AdmissionError> {
        let mut policies = PolicyTable::from_env()?;
        if let Some(path) = &config.policy_file {
            let merged = policies.merge_file(path)?;
            tracing::info!("Loaded {} policies from {}", merged, path.display());
        }
        for (name, policy) in policies.iter() {
            tracing::info!(
                policy = %name,
                capacity = policy.capacity(),
                window_ms = policy.window_ms(),
                "policy configured"
            );
        }

        let store = build_store(&config).await?;
        let controller = Arc::new(AdmissionController::new(store, config.controller_settings()));

        let state = AppState::new(
            controller.clone(),
            policies,
            KeyGenerator::new(config.key_strategy.clone()),
        )
        .with_origins(OriginPolicy::from_list(&config.allowed_origins))
        .with_admin_key(config.admin_key.clone());
        if config.admin_key.is_none() {
            tracing::warn!("No admin key configured: bucket resets and explicit-key checks are disabled");
        }

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
            controller,
            sweep_interval: config.sweep_interval,
        })
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Admission server listening on {}", listener.local_addr()?);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        let sweeper = Sweeper::new(self.controller.clone(), self.sweep_interval).spawn();

        let served = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        sweeper.stop().await;
        served
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn BucketStore>, AdmissionError> {
    match config.store {
        StoreKind::Memory => {
            tracing::warn!(
                "Using in-memory bucket store: quotas are enforced per instance, not globally"
            );
            Ok(Arc::new(MemoryStore::new(config.shards, config.retention_factor)))
        }
        StoreKind::Redis => {
            tracing::info!("Connecting to Redis bucket store at {}", config.redis_url);
            let store = RedisStore::connect(&config.redis_url, config.retention_factor).await?;
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
