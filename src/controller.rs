use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bucket::{Bucket, Decision};
use crate::clock::{Clock, SystemClock};
use crate::error::{AdmissionError, Result, StoreError};
use crate::policy::Policy;
use crate::store::BucketStore;

/// Decision to hand out when the bucket store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub key_prefix: String,
    pub fail_mode: FailMode,
    pub store_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            key_prefix: "admission".to_string(),
            fail_mode: FailMode::Open,
            store_timeout: Duration::from_millis(50),
        }
    }
}

/// Token-bucket admission control over a pluggable [`BucketStore`].
pub struct AdmissionController {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
    fallbacks: AtomicU64,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn BucketStore>, settings: ControllerSettings) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), settings)
    }

    pub fn with_clock(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Take one token from `key`'s bucket under `policy`.
    ///
    /// Only an empty key is an error. Store failures and timeouts become the configured
    /// [`FailMode`] decision.
    pub async fn check_and_consume(&self, key: &str, policy: &Policy) -> Result<Decision> {
        validate_identity(key)?;
        let store_key = self.store_key(key, policy);
        let now = self.clock.now_ms();

        match self.bounded(self.store.admit(&store_key, policy, now)).await {
            Ok(decision) => {
                debug!(
                    key = %key,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    reset_in_ms = decision.reset_in_ms,
                    "admission decided"
                );
                Ok(decision)
            }
            Err(err) => Ok(self.fallback(key, policy, &err)),
        }
    }

    /// Report what a check would see for `key` without consuming a token.
    pub async fn peek(&self, key: &str, policy: &Policy) -> Result<Decision> {
        validate_identity(key)?;
        let current = self.bounded(self.store.get(&self.store_key(key, policy))).await?;
        Ok(Bucket::peek(current.as_ref(), policy, self.clock.now_ms()))
    }

    /// Drop `key`'s bucket; the next check starts again at full capacity.
    pub async fn reset(&self, key: &str, policy: &Policy) -> Result<bool> {
        validate_identity(key)?;
        let removed = self.bounded(self.store.remove(&self.store_key(key, policy))).await?;
        debug!(key = %key, removed, "bucket reset");
        Ok(removed)
    }

    pub async fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        Ok(self.store.sweep(now).await?)
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.bounded(self.store.ping()).await?)
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Decisions produced by the fail-open/fail-closed fallback so far.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    fn store_key(&self, key: &str, policy: &Policy) -> String {
        format!(
            "{}:{}/{}:{}",
            self.settings.key_prefix,
            policy.capacity(),
            policy.window_ms(),
            key
        )
    }

    fn fallback(&self, key: &str, policy: &Policy, err: &StoreError) -> Decision {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        let allowed = self.settings.fail_mode == FailMode::Open;
        warn!(
            key = %key,
            error = %err,
            fail_mode = ?self.settings.fail_mode,
            allowed,
            "bucket store unavailable, using fallback decision"
        );
        Decision {
            allowed,
            remaining: if allowed { policy.capacity() - 1 } else { 0 },
            reset_in_ms: policy.window_ms(),
            limit: policy.capacity(),
            degraded: true,
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(
                self.settings.store_timeout.as_millis() as u64,
            )),
        }
    }
}

fn validate_identity(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(AdmissionError::InvalidKey(
            "caller identity cannot be empty".to_string(),
        ));
    }
    Ok(())
}
