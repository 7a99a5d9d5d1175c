use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::BucketStore;
use crate::bucket::{Bucket, Decision};
use crate::error::StoreError;
use crate::policy::Policy;

/// Apply one request to the bucket hash server-side: hard reset when the window has passed,
/// then take a token if one is left. Denials leave the hash untouched.
///
/// KEYS[1] bucket hash
/// ARGV[1] now (unix ms)
/// ARGV[2] capacity
/// ARGV[3] window_ms
/// ARGV[4] expiry in milliseconds
///
/// Returns `{allowed, tokens, reset_at}`.
static ADMIT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local current = redis.call('HMGET', KEYS[1], 'tokens', 'reset_at')
local tokens = tonumber(current[1])
local reset_at = tonumber(current[2])
local changed = 0
if tokens == nil or reset_at == nil or now > reset_at then
  tokens = capacity
  reset_at = now + window
  changed = 1
end
if tokens > capacity then
  tokens = capacity
  changed = 1
end
local allowed = 0
if tokens > 0 then
  tokens = tokens - 1
  allowed = 1
  changed = 1
end
if changed == 1 then
  redis.call('HSET', KEYS[1], 'tokens', tokens, 'reset_at', reset_at, 'window_ms', window)
  redis.call('PEXPIRE', KEYS[1], ARGV[4])
end
return {allowed, tokens, reset_at}
"#,
    )
});

/// Compare the stored hash with the expected fields and replace it in one step.
///
/// KEYS[1] bucket hash
/// ARGV[1] 1 if a bucket is expected, 0 if the key must be absent
/// ARGV[2..3] expected tokens, reset_at
/// ARGV[4..6] next tokens, reset_at, window_ms
/// ARGV[7] expiry in milliseconds
static COMPARE_AND_SWAP: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local current = redis.call('HMGET', KEYS[1], 'tokens', 'reset_at')
if ARGV[1] == '0' then
  if current[1] then return 0 end
elseif current[1] ~= ARGV[2] or current[2] ~= ARGV[3] then
  return 0
end
redis.call('HSET', KEYS[1], 'tokens', ARGV[4], 'reset_at', ARGV[5], 'window_ms', ARGV[6])
redis.call('PEXPIRE', KEYS[1], ARGV[7])
return 1
"#,
    )
});

/// Buckets kept as Redis hashes (`tokens`, `reset_at`, `window_ms`).
///
/// Every write sets a key expiry covering the window plus the retention period, so Redis
/// performs eviction and [`BucketStore::sweep`] is a no-op.
pub struct RedisStore {
    connection: ConnectionManager,
    retention_factor: u32,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, retention_factor: u32) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            StoreError::Connection(format!("failed to create Redis client: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            warn!("Failed to connect to Redis: {}", e);
            StoreError::Connection(format!("failed to connect to Redis: {}", e))
        })?;

        let store = Self {
            connection,
            retention_factor,
        };
        store.ping().await?;
        debug!("Connected to Redis bucket store");
        Ok(store)
    }

    fn expiry_ms(&self, bucket: &Bucket) -> u64 {
        expiry_ms(bucket.window_ms, self.retention_factor)
    }
}

fn expiry_ms(window_ms: u64, retention_factor: u32) -> u64 {
    window_ms
        .saturating_mul(u64::from(retention_factor).saturating_add(1))
        .max(1)
}

/// `ARGV` for the admit script, in order.
fn admit_args(policy: &Policy, now_ms: u64, retention_factor: u32) -> [u64; 4] {
    [
        now_ms,
        u64::from(policy.capacity()),
        policy.window_ms(),
        expiry_ms(policy.window_ms(), retention_factor),
    ]
}

/// Turn the admit script's `{allowed, tokens, reset_at}` reply into a [`Decision`].
fn decode_admit_reply(
    key: &str,
    reply: &[i64],
    policy: &Policy,
    now_ms: u64,
) -> Result<Decision, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let [allowed, tokens, reset_at] = reply else {
        return Err(corrupt(format!("expected 3 reply fields, got {}", reply.len())));
    };
    let remaining = u32::try_from(*tokens)
        .map_err(|_| corrupt(format!("tokens out of range: {}", tokens)))?;
    let reset_at =
        u64::try_from(*reset_at).map_err(|_| corrupt(format!("reset_at out of range: {}", reset_at)))?;

    Ok(Decision {
        allowed: *allowed == 1,
        remaining: remaining.min(policy.capacity()),
        reset_in_ms: reset_at.saturating_sub(now_ms),
        limit: policy.capacity(),
        degraded: false,
    })
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: Vec<Option<u64>> = ::redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("reset_at")
            .arg("window_ms")
            .query_async(&mut conn)
            .await?;

        match fields.as_slice() {
            [None, None, None] => Ok(None),
            [Some(tokens), Some(reset_at), Some(window_ms)] => {
                let tokens = u32::try_from(*tokens).map_err(|_| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("tokens out of range: {}", tokens),
                })?;
                Ok(Some(Bucket {
                    tokens,
                    reset_at: *reset_at,
                    window_ms: *window_ms,
                }))
            }
            _ => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "incomplete bucket hash".to_string(),
            }),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Bucket>,
        next: &Bucket,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = COMPARE_AND_SWAP.key(key);
        match expected {
            Some(bucket) => invocation.arg(1).arg(bucket.tokens).arg(bucket.reset_at),
            None => invocation.arg(0).arg(0).arg(0),
        };
        invocation
            .arg(next.tokens)
            .arg(next.reset_at)
            .arg(next.window_ms)
            .arg(self.expiry_ms(next));

        let swapped: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(swapped == 1)
    }

    async fn admit(&self, key: &str, policy: &Policy, now_ms: u64) -> Result<Decision, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = ADMIT.key(key);
        for arg in admit_args(policy, now_ms, self.retention_factor) {
            invocation.arg(arg);
        }

        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        decode_admit_reply(key, &reply, policy, now_ms)
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn sweep(&self, _now_ms: u64) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_shared(&self) -> bool {
        true
    }
}
