//! Pipeline State - 管線狀態

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::domain::{Action, PositionState, Symbol};
use crate::error::RiskRejection;
use crate::platform::{DeleverageSuggestion, RiskMetrics};

/// What the pipeline did with one symbol's action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Handed to the execution venue
    Dispatched { dispatch_id: Uuid },
    /// Refused by the risk gate; the mandate is marked rejected
    Rejected { rejection: RiskRejection },
    /// Exit imposed by the risk gate; `dispatch_id` is absent when the
    /// position had nothing to send
    ForcedExit {
        distance: rust_decimal::Decimal,
        dispatch_id: Option<Uuid>,
    },
    /// An order is already working on the symbol; retried next cycle
    Deferred { reason: String },
    /// The entry slot is held by another order
    Conflict { holder: Option<String> },
    /// Entry suppressed while the pipeline is halted
    Halted,
    /// The action could not be applied
    Failed { reason: String },
    /// Nothing to send (HOLD or no admissible mandate)
    NoAction,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Dispatched { .. } => "dispatched",
            DecisionOutcome::Rejected { .. } => "rejected",
            DecisionOutcome::ForcedExit { .. } => "forced_exit",
            DecisionOutcome::Deferred { .. } => "deferred",
            DecisionOutcome::Conflict { .. } => "conflict",
            DecisionOutcome::Halted => "halted",
            DecisionOutcome::Failed { .. } => "failed",
            DecisionOutcome::NoAction => "no_action",
        }
    }

    pub fn dispatch_id(&self) -> Option<Uuid> {
        match self {
            DecisionOutcome::Dispatched { dispatch_id } => Some(*dispatch_id),
            DecisionOutcome::ForcedExit { dispatch_id, .. } => *dispatch_id,
            _ => None,
        }
    }
}

/// Audit record for one symbol in one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub cycle: u64,
    pub snapshot_version: u64,
    pub symbol: Symbol,
    /// Position state the decision was made against
    pub position_state: PositionState,
    pub action: Action,
    pub outcome: DecisionOutcome,
    pub decided_at: DateTime<Utc>,
}

/// Result of one decision cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u64,
    /// None when the cycle was skipped before reading a snapshot
    pub snapshot_version: Option<u64>,
    /// Snapshot was older than the staleness threshold
    pub stale: bool,
    pub expired_mandates: usize,
    pub decisions: Vec<DecisionRecord>,
}

impl CycleSummary {
    pub fn skipped(cycle: u64) -> Self {
        Self {
            cycle,
            ..Default::default()
        }
    }

    pub fn decision(&self, symbol: &Symbol) -> Option<&DecisionRecord> {
        self.decisions.iter().find(|d| &d.symbol == symbol)
    }

    pub fn dispatched(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.outcome.dispatch_id().is_some())
            .count()
    }

    pub fn count(&self, outcome: &str) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.outcome.as_str() == outcome)
            .count()
    }
}

/// Risk figures computed at the end of the latest cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub cycle: u64,
    pub metrics: RiskMetrics,
    pub deleverage: Vec<DeleverageSuggestion>,
}

/// Monotonic pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    cycles: AtomicU64,
    stale_cycles: AtomicU64,
    dispatched: AtomicU64,
    rejections: AtomicU64,
    forced_exits: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
    reports: AtomicU64,
    persist_failures: AtomicU64,
}

impl PipelineStats {
    pub fn record_cycle(&self, summary: &CycleSummary) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if summary.stale {
            self.stale_cycles.fetch_add(1, Ordering::Relaxed);
        }
        for decision in &summary.decisions {
            let counter = match decision.outcome {
                DecisionOutcome::Dispatched { .. } => &self.dispatched,
                DecisionOutcome::Rejected { .. } => &self.rejections,
                DecisionOutcome::ForcedExit { .. } => &self.forced_exits,
                DecisionOutcome::Conflict { .. } => &self.conflicts,
                DecisionOutcome::Failed { .. } => &self.failures,
                DecisionOutcome::Deferred { .. }
                | DecisionOutcome::Halted
                | DecisionOutcome::NoAction => continue,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_report(&self) {
        self.reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            stale_cycles: self.stale_cycles.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            forced_exits: self.forced_exits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            reports: self.reports.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub cycles: u64,
    pub stale_cycles: u64,
    pub dispatched: u64,
    pub rejections: u64,
    pub forced_exits: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub reports: u64,
    pub persist_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(outcome: DecisionOutcome) -> DecisionRecord {
        DecisionRecord {
            cycle: 1,
            snapshot_version: 1,
            symbol: Symbol::from("BTC"),
            position_state: PositionState::Open,
            action: Action::forced_exit(Symbol::from("BTC")),
            outcome,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn test_stats_count_outcomes() {
        let stats = PipelineStats::default();
        let summary = CycleSummary {
            cycle: 1,
            snapshot_version: Some(1),
            decisions: vec![
                record(DecisionOutcome::ForcedExit {
                    distance: dec!(0.01),
                    dispatch_id: Some(Uuid::new_v4()),
                }),
                record(DecisionOutcome::Conflict { holder: None }),
                record(DecisionOutcome::NoAction),
            ],
            ..Default::default()
        };
        stats.record_cycle(&summary);

        let snap = stats.snapshot();
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.forced_exits, 1);
        assert_eq!(snap.conflicts, 1);
        assert_eq!(snap.dispatched, 0);
        assert_eq!(summary.dispatched(), 1);
        assert_eq!(summary.count("no_action"), 1);
    }
}
