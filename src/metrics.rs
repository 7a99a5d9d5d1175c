use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::bucket::Decision;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    /// Decisions produced by the store-unavailable fallback.
    pub degraded_decisions: u64,
    pub since: u64,
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            allowed_requests: 0,
            denied_requests: 0,
            degraded_decisions: 0,
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

impl AdmissionMetrics {
    fn record(&mut self, decision: &Decision) {
        self.total_requests += 1;
        if decision.allowed {
            self.allowed_requests += 1;
        } else {
            self.denied_requests += 1;
        }
        if decision.degraded {
            self.degraded_decisions += 1;
        }
    }

    fn absorb(&mut self, other: &AdmissionMetrics) {
        self.total_requests += other.total_requests;
        self.allowed_requests += other.allowed_requests;
        self.denied_requests += other.denied_requests;
        self.degraded_decisions += other.degraded_decisions;
        self.since = self.since.min(other.since);
    }
}

/// Decision counters keyed by policy name.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    policy_metrics: Arc<RwLock<BTreeMap<String, AdmissionMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_decision(&self, policy: &str, decision: &Decision) {
        let mut metrics = self.policy_metrics.write().await;
        metrics.entry(policy.to_string()).or_default().record(decision);
    }

    pub async fn get_policy_metrics(&self, policy: &str) -> Option<AdmissionMetrics> {
        let metrics = self.policy_metrics.read().await;
        metrics.get(policy).cloned()
    }

    pub async fn get_all_metrics(&self) -> BTreeMap<String, AdmissionMetrics> {
        let metrics = self.policy_metrics.read().await;
        metrics.clone()
    }

    pub async fn get_global_metrics(&self) -> AdmissionMetrics {
        let metrics = self.policy_metrics.read().await;
        let mut global = AdmissionMetrics::default();
        for policy_metrics in metrics.values() {
            global.absorb(policy_metrics);
        }
        global
    }
}
