//! Reservation Manager - 進場預留
//!
//! One atomic slot per symbol holds the ticket of the entry currently in
//! flight (0 = free). Acquisition is a single compare-and-swap; a caller that
//! loses the race gets a [`ReservationConflict`] immediately.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::Symbol;

const FREE: u64 = 0;

/// Proof of the exclusive right to run one entry for a symbol.
///
/// Deliberately not `Clone`: there is exactly one token per held slot.
#[derive(Debug, PartialEq, Eq)]
pub struct ReservationToken {
    symbol: Symbol,
    holder_id: String,
    acquired_at: DateTime<Utc>,
    ticket: u64,
}

impl ReservationToken {
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Copyable description of this token for logs and audit
    pub fn receipt(&self) -> ReservationReceipt {
        ReservationReceipt {
            symbol: self.symbol.clone(),
            holder_id: self.holder_id.clone(),
            acquired_at: self.acquired_at,
            ticket: self.ticket,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReceipt {
    pub symbol: Symbol,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ticket: u64,
}

/// The slot was already held. Not an error: the entry attempt is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConflict {
    pub symbol: Symbol,
    /// Current holder, when it could be identified
    pub holder: Option<ReservationReceipt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    /// The slot was already free
    AlreadyReleased,
    /// The slot is held by a different ticket
    NotHolder,
}

#[derive(Debug, Default)]
pub struct ReservationManager {
    slots: DashMap<Symbol, Arc<AtomicU64>>,
    holders: DashMap<u64, ReservationReceipt>,
    next_ticket: AtomicU64,
}

impl ReservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, symbol: &Symbol) -> Arc<AtomicU64> {
        if let Some(slot) = self.slots.get(symbol) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(symbol.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(FREE)))
                .value(),
        )
    }

    /// Claim `symbol` for `holder_id`; never blocks or queues
    pub fn try_reserve(
        &self,
        symbol: &Symbol,
        holder_id: &str,
    ) -> Result<ReservationToken, ReservationConflict> {
        let slot = self.slot(symbol);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;

        match slot.compare_exchange(FREE, ticket, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                let token = ReservationToken {
                    symbol: symbol.clone(),
                    holder_id: holder_id.to_string(),
                    acquired_at: Utc::now(),
                    ticket,
                };
                self.holders.insert(ticket, token.receipt());
                Ok(token)
            }
            Err(current) => Err(ReservationConflict {
                symbol: symbol.clone(),
                holder: self.holders.get(&current).map(|r| r.value().clone()),
            }),
        }
    }

    /// Release a held token
    pub fn release(&self, token: ReservationToken) -> ReleaseOutcome {
        self.release_ticket(&token.symbol, token.ticket)
    }

    /// Release by receipt; used when the token itself was lost with a failed task
    pub fn release_receipt(&self, receipt: &ReservationReceipt) -> ReleaseOutcome {
        self.release_ticket(&receipt.symbol, receipt.ticket)
    }

    fn release_ticket(&self, symbol: &Symbol, ticket: u64) -> ReleaseOutcome {
        let Some(slot) = self.slots.get(symbol).map(|s| Arc::clone(s.value())) else {
            return ReleaseOutcome::AlreadyReleased;
        };

        match slot.compare_exchange(ticket, FREE, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.holders.remove(&ticket);
                ReleaseOutcome::Released
            }
            Err(FREE) => ReleaseOutcome::AlreadyReleased,
            Err(_) => ReleaseOutcome::NotHolder,
        }
    }

    pub fn is_reserved(&self, symbol: &Symbol) -> bool {
        self.slots
            .get(symbol)
            .map(|s| s.value().load(Ordering::Acquire) != FREE)
            .unwrap_or(false)
    }

    pub fn holder(&self, symbol: &Symbol) -> Option<ReservationReceipt> {
        let ticket = self.slots.get(symbol)?.value().load(Ordering::Acquire);
        if ticket == FREE {
            return None;
        }
        self.holders.get(&ticket).map(|r| r.value().clone())
    }

    pub fn held_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.value().load(Ordering::Acquire) != FREE)
            .count()
    }

    /// Reservations held longer than `max_age_ms` as of `now`
    pub fn stale_reservations(&self, max_age_ms: u64, now: DateTime<Utc>) -> Vec<ReservationReceipt> {
        let mut stale: Vec<ReservationReceipt> = self
            .holders
            .iter()
            .filter(|r| (now - r.acquired_at).num_milliseconds() > max_age_ms as i64)
            .map(|r| r.value().clone())
            .collect();
        stale.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_second_reserve_conflicts() {
        let manager = ReservationManager::new();
        let x = Symbol::from("X");

        let token = manager.try_reserve(&x, "a").unwrap();
        let conflict = manager.try_reserve(&x, "b").unwrap_err();
        assert_eq!(conflict.symbol, x);
        assert_eq!(conflict.holder.unwrap().holder_id, "a");
        assert!(manager.is_reserved(&x));

        assert_eq!(manager.release(token), ReleaseOutcome::Released);
        assert!(!manager.is_reserved(&x));
        assert!(manager.try_reserve(&x, "c").is_ok());
    }

    #[test]
    fn test_release_is_idempotent_and_holder_only() {
        let manager = ReservationManager::new();
        let x = Symbol::from("X");

        let first = manager.try_reserve(&x, "a").unwrap();
        let receipt = first.receipt();
        assert_eq!(manager.release(first), ReleaseOutcome::Released);
        assert_eq!(manager.release_receipt(&receipt), ReleaseOutcome::AlreadyReleased);

        let _second = manager.try_reserve(&x, "b").unwrap();
        assert_eq!(manager.release_receipt(&receipt), ReleaseOutcome::NotHolder);
        assert!(manager.is_reserved(&x));
    }

    #[test]
    fn test_symbols_are_independent() {
        let manager = ReservationManager::new();
        let _a = manager.try_reserve(&Symbol::from("A"), "h").unwrap();
        let _b = manager.try_reserve(&Symbol::from("B"), "h").unwrap();
        assert_eq!(manager.held_count(), 2);
    }

    #[test]
    fn test_stale_reservations() {
        let manager = ReservationManager::new();
        let token = manager.try_reserve(&Symbol::from("A"), "h").unwrap();
        assert!(manager.stale_reservations(1_000, Utc::now()).is_empty());

        let later = token.acquired_at() + Duration::milliseconds(1_500);
        let stale = manager.stale_reservations(1_000, later);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].ticket, token.ticket());
    }
}
