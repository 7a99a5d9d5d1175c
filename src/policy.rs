use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{AdmissionError, Result};

/// Window and quota applied to every caller of one protected handler.
///
/// Constructed only through [`Policy::new`] (or deserialization, which goes through it), so a
/// `Policy` value always has `capacity >= 1` and a window of at least one millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicySpec", into = "PolicySpec")]
pub struct Policy {
    window: Duration,
    capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicySpec {
    #[serde(with = "humantime_serde")]
    window: Duration,
    capacity: u32,
}

impl TryFrom<PolicySpec> for Policy {
    type Error = AdmissionError;

    fn try_from(spec: PolicySpec) -> Result<Self> {
        Policy::new(spec.window, spec.capacity)
    }
}

impl From<Policy> for PolicySpec {
    fn from(policy: Policy) -> Self {
        Self {
            window: policy.window,
            capacity: policy.capacity,
        }
    }
}

impl Policy {
    pub fn new(window: Duration, capacity: u32) -> Result<Self> {
        if capacity < 1 {
            return Err(AdmissionError::InvalidPolicy(
                "capacity must be at least 1".to_string(),
            ));
        }
        if window < Duration::from_millis(1) {
            return Err(AdmissionError::InvalidPolicy(
                "window must be at least 1ms".to_string(),
            ));
        }
        Ok(Self { window, capacity })
    }

    /// `capacity` requests per 60-second window.
    pub fn per_minute(capacity: u32) -> Result<Self> {
        Self::new(Duration::from_secs(60), capacity)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Per-handler defaults: (policy name, requests per minute, override variable).
pub const DEFAULT_POLICIES: &[(&str, u32, &str)] = &[
    ("calculate-apo", 30, "APO_RATE_LIMIT_PER_MIN"),
    ("cascade-risk", 30, "CASCADE_RATE_LIMIT_PER_MIN"),
    ("record-outcome", 15, "OUTCOME_RATE_LIMIT_PER_MIN"),
    ("automation-resistance-score", 60, "AR_RATE_LIMIT_PER_MIN"),
    ("simulate-career-trajectory", 30, "SIM_RATE_LIMIT_PER_MIN"),
    ("portfolio-basics", 30, "PORTFOLIO_RATE_LIMIT_PER_MIN"),
    ("estimate-skill-half-life", 60, "HL_RATE_LIMIT_PER_MIN"),
];

/// Named policies the service can enforce.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct PolicyTable {
    policies: BTreeMap<String, Policy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in handler policies, without environment overrides.
    pub fn defaults() -> Result<Self> {
        let mut table = Self::new();
        for (name, per_minute, _) in DEFAULT_POLICIES {
            table.insert(*name, Policy::per_minute(*per_minute)?);
        }
        Ok(table)
    }

    /// Built-in policies with the per-handler `*_RATE_LIMIT_PER_MIN` variables applied.
    pub fn from_env() -> Result<Self> {
        let mut table = Self::defaults()?;
        table.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(table)
    }

    /// Replace the capacity of each default policy whose override variable `lookup` resolves.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, _, var) in DEFAULT_POLICIES {
            let Some(raw) = lookup(var) else { continue };
            let capacity: u32 = raw.trim().parse().map_err(|_| {
                AdmissionError::Configuration(format!("{} must be a whole number, got {:?}", var, raw))
            })?;
            tracing::debug!(policy = %name, capacity, "policy capacity overridden from {}", var);
            self.insert(*name, Policy::per_minute(capacity)?);
        }
        Ok(())
    }

    /// Merge a JSON file of the form `{"name": {"window": "1m", "capacity": 30}}`.
    pub fn merge_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AdmissionError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        self.merge_json(&raw)
    }

    pub fn merge_json(&mut self, raw: &str) -> Result<usize> {
        let entries: BTreeMap<String, Policy> = serde_json::from_str(raw)
            .map_err(|e| AdmissionError::InvalidPolicy(format!("policy file: {}", e)))?;
        let count = entries.len();
        for (name, policy) in entries {
            self.insert(name, policy);
        }
        Ok(count)
    }

    pub fn insert(&mut self, name: impl Into<String>, policy: Policy) {
        self.policies.insert(name.into(), policy);
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    pub fn require(&self, name: &str) -> Result<Policy> {
        self.get(name)
            .copied()
            .ok_or_else(|| AdmissionError::UnknownPolicy(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Policy)> {
        self.policies.iter().map(|(name, policy)| (name.as_str(), policy))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
