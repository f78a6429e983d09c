//! Halt latch
//!
//! Tripped on conditions that need an operator: a reservation that outlived
//! its order, or a structural invariant violation. While tripped no new entry
//! is dispatched; exits keep flowing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    /// A reservation was not released before its deadline
    StaleReservation { symbol: String, ticket: u64 },
    /// A position broke a structural invariant
    InvariantViolation { symbol: String, detail: String },
    /// Any other error the pipeline cannot continue past
    Fatal { detail: String },
    /// Operator request
    Manual { reason: String },
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::StaleReservation { symbol, ticket } => {
                write!(f, "stale reservation on {} (ticket {})", symbol, ticket)
            }
            HaltReason::InvariantViolation { symbol, detail } => {
                write!(f, "invariant violation on {}: {}", symbol, detail)
            }
            HaltReason::Fatal { detail } => write!(f, "fatal: {}", detail),
            HaltReason::Manual { reason } => write!(f, "manual: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HaltState {
    pub reason: Option<HaltReason>,
    pub halted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct Halt {
    halted: AtomicBool,
    state: RwLock<HaltState>,
}

impl Halt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast atomic check
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Trip the latch. The first reason is kept; later trips are ignored.
    pub async fn trip(&self, reason: HaltReason) {
        let mut state = self.state.write().await;
        if state.reason.is_some() {
            return;
        }
        error!(reason = %reason, "pipeline halted, operator intervention required");
        state.reason = Some(reason);
        state.halted_at = Some(Utc::now());
        self.halted.store(true, Ordering::Release);
    }

    /// Operator reset
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        if let Some(reason) = state.reason.take() {
            info!(previous = %reason, "halt cleared");
        }
        state.halted_at = None;
        self.halted.store(false, Ordering::Release);
    }

    pub async fn state(&self) -> HaltState {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let halt = Halt::new();
        assert!(!halt.is_halted());

        halt.trip(HaltReason::Manual { reason: "first".into() }).await;
        halt.trip(HaltReason::Manual { reason: "second".into() }).await;
        assert!(halt.is_halted());
        assert_eq!(
            halt.state().await.reason,
            Some(HaltReason::Manual { reason: "first".into() })
        );

        halt.clear().await;
        assert!(!halt.is_halted());
        assert!(halt.state().await.reason.is_none());
    }
}
