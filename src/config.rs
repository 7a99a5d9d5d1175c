use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::{ControllerSettings, FailMode};
use crate::error::AdmissionError;
use crate::key_generator::KeyStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Per-process buckets; each instance enforces its own quota
    Memory,
    /// Buckets shared by all instances through Redis
    Redis,
}

/// Service configuration, from flags or environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "admission", version, about = "Token-bucket admission control service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Bucket store backend
    #[arg(long, env = "ADMISSION_STORE", value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    /// Redis connection URL, used with `--store redis`
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix for bucket keys in the store
    #[arg(long, env = "ADMISSION_KEY_PREFIX", default_value = "admission")]
    pub key_prefix: String,

    /// Decision when the store is unreachable
    #[arg(long, env = "ADMISSION_FAIL_MODE", value_enum, default_value_t = FailMode::Open)]
    pub fail_mode: FailMode,

    /// Upper bound on a single store operation
    #[arg(long, env = "ADMISSION_STORE_TIMEOUT", default_value = "50ms", value_parser = humantime::parse_duration)]
    pub store_timeout: Duration,

    /// How often stale buckets are evicted
    #[arg(long, env = "ADMISSION_SWEEP_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    pub sweep_interval: Duration,

    /// Windows a bucket is kept after its reset time has passed
    #[arg(long, env = "ADMISSION_RETENTION_FACTOR", default_value_t = 2)]
    pub retention_factor: u32,

    /// Lock shards in the memory store (power of two, at least 2)
    #[arg(long, env = "ADMISSION_SHARDS", default_value_t = 16)]
    pub shards: usize,

    /// Caller identity: ip, api-key, user-id, or a `+`-joined combination
    #[arg(long, env = "ADMISSION_KEY_STRATEGY", default_value = "ip", value_parser = parse_key_strategy)]
    pub key_strategy: KeyStrategy,

    /// JSON file with additional or replacement policies
    #[arg(long, env = "ADMISSION_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Comma-separated CORS allow-list; `*` allows all
    #[arg(long, env = "APO_ALLOWED_ORIGINS", default_value = "*")]
    pub allowed_origins: String,

    /// Secret expected in `x-admin-key` for bucket resets and explicit-key checks;
    /// those operations are refused when unset
    #[arg(long, env = "ADMISSION_ADMIN_KEY", hide_env_values = true)]
    pub admin_key: Option<String>,

    /// Log level for the admission crate
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

fn parse_key_strategy(raw: &str) -> Result<KeyStrategy, String> {
    raw.parse().map_err(|e: AdmissionError| e.to_string())
}

impl Config {
    /// Load configuration from command-line arguments and environment variables
    pub fn from_env() -> Result<Self, AdmissionError> {
        let config = Self::try_parse().map_err(|e| AdmissionError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.store == StoreKind::Redis
            && !self.redis_url.starts_with("redis://")
            && !self.redis_url.starts_with("rediss://")
        {
            return Err(AdmissionError::Configuration(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }
        if self.shards < 2 || !self.shards.is_power_of_two() {
            return Err(AdmissionError::Configuration(format!(
                "shard count must be a power of two of at least 2, got {}",
                self.shards
            )));
        }
        if self.retention_factor == 0 {
            return Err(AdmissionError::Configuration(
                "retention factor must be at least 1".to_string(),
            ));
        }
        if self.store_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(AdmissionError::Configuration(
                "store timeout and sweep interval must be non-zero".to_string(),
            ));
        }
        if matches!(&self.admin_key, Some(key) if key.trim().is_empty()) {
            return Err(AdmissionError::Configuration(
                "admin key cannot be blank".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(AdmissionError::Configuration(
                "key prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            key_prefix: self.key_prefix.clone(),
            fail_mode: self.fail_mode,
            store_timeout: self.store_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["admission"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_parse() {
        let config = parse(&[
            "--bind-addr",
            "0.0.0.0:8080",
            "--store",
            "redis",
            "--fail-mode",
            "closed",
            "--store-timeout",
            "20ms",
            "--sweep-interval",
            "5m",
            "--key-strategy",
            "api-key+ip",
        ]);

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.store, StoreKind::Redis);
        assert_eq!(config.fail_mode, FailMode::Closed);
        assert_eq!(config.store_timeout, Duration::from_millis(20));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(
            config.key_strategy,
            KeyStrategy::Composite(vec![KeyStrategy::ApiKey, KeyStrategy::IpAddress])
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_key_strategy() {
        assert!(Config::try_parse_from(["admission", "--key-strategy", "cookie"]).is_err());
    }

    #[test]
    fn test_validate_redis_url() {
        let mut config = parse(&["--store", "redis", "--redis-url", "http://localhost"]);
        assert!(config.validate().is_err());
        config.store = StoreKind::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_shards_and_retention() {
        let config = parse(&["--shards", "12"]);
        assert!(config.validate().is_err());
        let config = parse(&["--shards", "1"]);
        assert!(config.validate().is_err());
        let config = parse(&["--shards", "64"]);
        assert!(config.validate().is_ok());
        let config = parse(&["--retention-factor", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_controller_settings() {
        let config = parse(&["--key-prefix", "edge", "--fail-mode", "closed"]);
        let settings = config.controller_settings();
        assert_eq!(settings.key_prefix, "edge");
        assert_eq!(settings.fail_mode, FailMode::Closed);
        assert_eq!(settings.store_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_admin_key() {
        assert!(parse(&[]).admin_key.is_none());
        let config = parse(&["--admin-key", "s3cret"]);
        assert_eq!(config.admin_key.as_deref(), Some("s3cret"));
        assert!(config.validate().is_ok());
        assert!(parse(&["--admin-key", "  "]).validate().is_err());
    }
}
