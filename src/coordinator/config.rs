//! Pipeline Configuration

use serde::{Deserialize, Serialize};

use super::aging::AgingPolicy;

/// Configuration for the decision pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How often to run a decision cycle (ms); 0 disables the timer and
    /// cycles only run when triggered through the handle
    pub cycle_interval_ms: u64,
    /// Capacity of each inter-stage channel
    pub channel_capacity: usize,
    /// Capacity of the decision audit broadcast
    pub audit_capacity: usize,
    /// Snapshots older than this are not decided on (ms)
    pub max_snapshot_age_ms: u64,
    /// A reservation held longer than this halts the pipeline (ms)
    pub reservation_timeout_ms: u64,
    /// Mandates older than this expire (ms); 0 disables expiry
    pub mandate_ttl_ms: u64,
    /// Holder id stamped on every reservation this pipeline takes
    pub holder_id: String,
    /// Age-based authority bump applied before arbitration
    pub aging: AgingPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 250,
            channel_capacity: 64,
            audit_capacity: 1024,
            max_snapshot_age_ms: 2_000,
            reservation_timeout_ms: 30_000,
            mandate_ttl_ms: 60_000,
            holder_id: "arbiter".to_string(),
            aging: AgingPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Config for manually driven pipelines (tests, simulation)
    pub fn manual() -> Self {
        Self {
            cycle_interval_ms: 0,
            ..Self::default()
        }
    }

    /// Collect human-readable problems, empty when valid
    pub fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.channel_capacity == 0 {
            errors.push("pipeline.channel_capacity must be > 0".to_string());
        }
        if self.audit_capacity == 0 {
            errors.push("pipeline.audit_capacity must be > 0".to_string());
        }
        if self.max_snapshot_age_ms == 0 {
            errors.push("pipeline.max_snapshot_age_ms must be > 0".to_string());
        }
        if self.reservation_timeout_ms == 0 {
            errors.push("pipeline.reservation_timeout_ms must be > 0".to_string());
        }
        if self.holder_id.trim().is_empty() {
            errors.push("pipeline.holder_id cannot be empty".to_string());
        }
        if self.aging.step_ms > 0 && self.aging.bump_per_step > self.aging.max_bump {
            errors.push("pipeline.aging.bump_per_step cannot exceed max_bump".to_string());
        }
        errors
    }
}
