//! Read-only monitoring view over a pipeline
//!
//! Every accessor returns a copy; nothing here can change pipeline state.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::coordinator::{DecisionRecord, HaltState, PipelineStatsSnapshot, RiskSnapshot};
use crate::coordinator::PipelineShared;
use crate::domain::{Position, Symbol};
use crate::platform::{HotStateReader, HotStateStats};

/// Health status for the decision core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    pub snapshot_version: u64,
    pub snapshot_age_ms: u64,
    pub positions_below_min_safe: Vec<Symbol>,
}

#[derive(Clone)]
pub struct MonitorView {
    shared: Arc<PipelineShared>,
    hot_state: HotStateReader,
}

impl MonitorView {
    pub(crate) fn new(shared: Arc<PipelineShared>, hot_state: HotStateReader) -> Self {
        Self { shared, hot_state }
    }

    pub fn positions(&self) -> BTreeMap<Symbol, Position> {
        self.shared.book.snapshot_all()
    }

    pub fn position(&self, symbol: &Symbol) -> Option<Position> {
        self.shared.book.get(symbol)
    }

    pub fn last_decision(&self, symbol: &Symbol) -> Option<DecisionRecord> {
        self.shared
            .last_decisions
            .get(symbol)
            .map(|r| r.value().clone())
    }

    /// Latest decision per symbol, in symbol order
    pub fn last_decisions(&self) -> Vec<DecisionRecord> {
        let mut records: Vec<DecisionRecord> = self
            .shared
            .last_decisions
            .iter()
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        records
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub async fn risk(&self) -> Option<RiskSnapshot> {
        self.shared.risk_snapshot.read().await.clone()
    }

    pub fn hot_state(&self) -> HotStateStats {
        self.hot_state.stats()
    }

    pub fn reservations_held(&self) -> usize {
        self.shared.reservations.held_count()
    }

    pub fn orders_working(&self) -> usize {
        self.shared.in_flight_count()
    }

    pub fn active_mandates(&self) -> usize {
        self.shared.registry.active_count()
    }

    pub async fn halt(&self) -> HaltState {
        self.shared.halt.state().await
    }

    /// Unhealthy while halted, degraded when the snapshot is older than
    /// `max_snapshot_age_ms` or a position sits below the safe distance
    pub async fn health(&self, max_snapshot_age_ms: u64) -> HealthReport {
        let halt = self.shared.halt.state().await;
        let (version, snapshot) = self.hot_state.read();
        let snapshot_age_ms = snapshot.age_ms(Utc::now());
        let below_min_safe = self
            .risk()
            .await
            .map(|r| r.metrics.below_min_safe)
            .unwrap_or_default();

        let status = if halt.reason.is_some() {
            HealthStatus::Unhealthy
        } else if snapshot_age_ms > max_snapshot_age_ms || !below_min_safe.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            halt_reason: halt.reason.map(|r| r.to_string()),
            snapshot_version: version,
            snapshot_age_ms,
            positions_below_min_safe: below_min_safe,
        }
    }
}

impl std::fmt::Debug for MonitorView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorView")
            .field("hot_state", &self.hot_state.stats())
            .field("stats", &self.stats())
            .finish()
    }
}
