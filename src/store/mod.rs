//! Bucket storage backends.
//!
//! Each store applies [`Bucket::admit`] to one key atomically:
//! - [`MemoryStore`] for a single process (per-instance quota)
//! - [`RedisStore`] for a quota shared by every instance

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::bucket::{Bucket, Decision};
use crate::error::StoreError;
use crate::policy::Policy;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError>;

    /// Write `next` only if the stored value still equals `expected` (`None` = absent).
    /// Returns false when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Bucket>,
        next: &Bucket,
    ) -> Result<bool, StoreError>;

    /// Take one token from `key` at `now_ms` as a single atomic step.
    ///
    /// The provided implementation re-reads and retries on every lost compare-and-swap until
    /// a decision is reached. Each lost round is another caller's successful write.
    async fn admit(&self, key: &str, policy: &Policy, now_ms: u64) -> Result<Decision, StoreError> {
        loop {
            let current = self.get(key).await?;
            let admission = Bucket::admit(current.as_ref(), policy, now_ms);
            if !admission.changed {
                return Ok(admission.decision);
            }
            if self
                .compare_and_swap(key, current.as_ref(), &admission.next)
                .await?
            {
                return Ok(admission.decision);
            }
            tracing::trace!(key = %key, "bucket changed concurrently, retrying");
            tokio::task::yield_now().await;
        }
    }

    /// Returns whether a bucket was present.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Drop buckets past their retention period, returning how many were evicted.
    async fn sweep(&self, now_ms: u64) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Number of buckets held, when cheap to know.
    fn len(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str;

    /// Whether the quota is enforced across instances.
    fn is_shared(&self) -> bool;
}
