use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::BucketStore;
use crate::bucket::{Bucket, Decision};
use crate::error::StoreError;
use crate::policy::Policy;

pub const DEFAULT_SHARDS: usize = 16;

/// In-process bucket map.
///
/// Every mutation goes through a `DashMap` entry, which holds the key's shard lock for the
/// whole read-modify-write. No lock is held across an `.await`.
pub struct MemoryStore {
    buckets: DashMap<String, Bucket>,
    retention_factor: u32,
}

impl MemoryStore {
    /// `shards` is rounded up to a power of two of at least 2.
    pub fn new(shards: usize, retention_factor: u32) -> Self {
        let shards = shards.max(2).next_power_of_two();
        Self {
            buckets: DashMap::with_shard_amount(shards),
            retention_factor,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS, 2)
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(self.buckets.get(key).map(|bucket| *bucket))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Bucket>,
        next: &Bucket,
    ) -> Result<bool, StoreError> {
        match (self.buckets.entry(key.to_string()), expected) {
            (Entry::Vacant(vacant), None) => {
                vacant.insert(*next);
                Ok(true)
            }
            (Entry::Occupied(mut occupied), Some(expected)) if occupied.get() == expected => {
                occupied.insert(*next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn admit(&self, key: &str, policy: &Policy, now_ms: u64) -> Result<Decision, StoreError> {
        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let admission = Bucket::admit(Some(occupied.get()), policy, now_ms);
                if admission.changed {
                    occupied.insert(admission.next);
                }
                Ok(admission.decision)
            }
            Entry::Vacant(vacant) => {
                let admission = Bucket::admit(None, policy, now_ms);
                vacant.insert(admission.next);
                Ok(admission.decision)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.buckets.remove(key).is_some())
    }

    async fn sweep(&self, now_ms: u64) -> Result<usize, StoreError> {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_stale(now_ms, self.retention_factor));
        Ok(before.saturating_sub(self.buckets.len()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn len(&self) -> Option<usize> {
        Some(self.buckets.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_shared(&self) -> bool {
        false
    }
}
