//! Health reporting utilities.

use serde::{Deserialize, Serialize};

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every metric is within its threshold.
    Healthy,
    /// At least one metric crossed its threshold.
    Degraded,
}

/// Limits beyond which a metric degrades health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Pending vector documents.
    pub max_pending_vectors: usize,
    /// Failed vector batches.
    pub max_failed_batches: u64,
    /// Adapter sync failures.
    pub max_adapter_failures: u64,
    /// Writes awaiting warm/cold persistence.
    pub max_persist_backlog: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_pending_vectors: 1_000,
            max_failed_batches: 10,
            max_adapter_failures: 100,
            max_persist_backlog: 10_000,
        }
    }
}

/// Live metrics fed into [`assess`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthInputs {
    /// Documents waiting in the vector queue.
    pub pending_vectors: usize,
    /// Vector batches that failed since start.
    pub failed_batches: u64,
    /// Adapter sync failures since start.
    pub adapter_failures: u64,
    /// Writes waiting for the persistence worker.
    pub persist_backlog: usize,
    /// Limits to compare against.
    pub thresholds: HealthThresholds,
}

/// Result of a health assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall verdict.
    pub status: HealthStatus,
    /// One line per threshold crossed.
    pub reasons: Vec<String>,
}

impl HealthReport {
    /// Returns `true` when healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Compares `inputs` with their thresholds.
#[must_use]
pub fn assess(inputs: &HealthInputs) -> HealthReport {
    let limits = inputs.thresholds;
    let mut reasons = Vec::new();
    if inputs.pending_vectors > limits.max_pending_vectors {
        reasons.push(format!(
            "vector queue backlog {} exceeds {}",
            inputs.pending_vectors, limits.max_pending_vectors
        ));
    }
    if inputs.failed_batches > limits.max_failed_batches {
        reasons.push(format!(
            "{} failed vector batches exceed {}",
            inputs.failed_batches, limits.max_failed_batches
        ));
    }
    if inputs.adapter_failures > limits.max_adapter_failures {
        reasons.push(format!(
            "{} adapter sync failures exceed {}",
            inputs.adapter_failures, limits.max_adapter_failures
        ));
    }
    if inputs.persist_backlog > limits.max_persist_backlog {
        reasons.push(format!(
            "persistence backlog {} exceeds {}",
            inputs.persist_backlog, limits.max_persist_backlog
        ));
    }

    let status = if reasons.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    HealthReport { status, reasons }
}
