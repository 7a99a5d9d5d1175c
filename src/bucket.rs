use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// Admission state for one caller identity under one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub tokens: u32,
    /// Unix milliseconds at which `tokens` refills to capacity.
    pub reset_at: u64,
    /// Window the bucket was created under; the sweeper derives retention from it.
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketState {
    Active,
    Exhausted,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_ms: u64,
    pub limit: u32,
    #[serde(default)]
    pub degraded: bool,
}

/// Next bucket state computed by [`Bucket::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub next: Bucket,
    pub decision: Decision,
    /// False when `next` equals the stored bucket and nothing needs writing.
    pub changed: bool,
}

impl Bucket {
    pub fn full(policy: &Policy, now: u64) -> Self {
        Self {
            tokens: policy.capacity(),
            reset_at: now.saturating_add(policy.window_ms()),
            window_ms: policy.window_ms(),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.reset_at
    }

    /// Whether the bucket has been past its reset time for longer than `retention_factor`
    /// windows and can be dropped.
    pub fn is_stale(&self, now: u64, retention_factor: u32) -> bool {
        let retention = self.window_ms.saturating_mul(u64::from(retention_factor));
        now.saturating_sub(self.reset_at) > retention
    }

    /// Apply one request to `current` (absent for an unseen key).
    ///
    /// An expired window is a hard reset to full capacity, then one token is taken if any
    /// is left. Pure: callers persist `next` atomically.
    pub fn admit(current: Option<&Bucket>, policy: &Policy, now: u64) -> Admission {
        let mut bucket = match current {
            Some(existing) if !existing.is_expired(now) => *existing,
            _ => Bucket::full(policy, now),
        };
        bucket.tokens = bucket.tokens.min(policy.capacity());

        let allowed = bucket.tokens > 0;
        if allowed {
            bucket.tokens -= 1;
        }

        let decision = Decision {
            allowed,
            remaining: bucket.tokens,
            reset_in_ms: bucket.reset_at.saturating_sub(now),
            limit: policy.capacity(),
            degraded: false,
        };

        Admission {
            next: bucket,
            decision,
            changed: current != Some(&bucket),
        }
    }

    /// What a check at `now` would observe, without taking a token.
    pub fn peek(current: Option<&Bucket>, policy: &Policy, now: u64) -> Decision {
        let (remaining, reset_in_ms) = match current {
            Some(existing) if !existing.is_expired(now) => (
                existing.tokens.min(policy.capacity()),
                existing.reset_at.saturating_sub(now),
            ),
            _ => (policy.capacity(), policy.window_ms()),
        };
        Decision {
            allowed: remaining > 0,
            remaining,
            reset_in_ms,
            limit: policy.capacity(),
            degraded: false,
        }
    }
}

impl Decision {
    /// `Exhausted` when no token is left in the current window.
    pub fn state(&self) -> BucketState {
        if self.remaining > 0 {
            BucketState::Active
        } else {
            BucketState::Exhausted
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.reset_in_ms.div_ceil(1000).max(1)
    }
}
