//! Mandate Registry - 指令登記
//!
//! Concurrent store of strategy mandates, keyed by id with a per-symbol index.
//! Both maps are sharded, so work on one symbol does not contend with another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;

use crate::domain::{Mandate, MandateId, MandateStatus, Symbol};
use crate::error::{ArbiterError, Result};

#[derive(Debug, Default)]
pub struct MandateRegistry {
    mandates: DashMap<MandateId, Mandate>,
    by_symbol: DashMap<Symbol, BTreeSet<MandateId>>,
}

impl MandateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a new mandate
    pub fn register(&self, mandate: Mandate) -> Result<()> {
        mandate.validate()?;

        let id = mandate.id;
        let symbol = mandate.symbol.clone();
        match self.mandates.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ArbiterError::DuplicateMandate(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(mandate);
            }
        }
        self.by_symbol.entry(symbol).or_default().insert(id);
        Ok(())
    }

    /// Move an active mandate to `status`, returning the updated mandate
    pub fn update_state(&self, id: MandateId, status: MandateStatus) -> Result<Mandate> {
        let mut entry = self
            .mandates
            .get_mut(&id)
            .ok_or(ArbiterError::UnknownMandate(id))?;

        if !entry.is_active() {
            return Err(ArbiterError::InvalidMandate(format!(
                "{}: cannot move from {} to {}",
                id, entry.status, status
            )));
        }
        entry.status = status;
        Ok(entry.clone())
    }

    pub fn get(&self, id: &MandateId) -> Option<Mandate> {
        self.mandates.get(id).map(|m| m.value().clone())
    }

    /// Active mandates for `symbol`, in id order
    pub fn active_by_symbol(&self, symbol: &Symbol) -> Vec<Mandate> {
        let ids: Vec<MandateId> = match self.by_symbol.get(symbol) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.mandates.get(id))
            .filter(|m| m.is_active())
            .map(|m| m.value().clone())
            .collect()
    }

    /// Symbols with at least one active mandate, sorted
    pub fn symbols_with_active(&self) -> Vec<Symbol> {
        self.mandates
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Mark active mandates stamped before `cutoff` as expired
    pub fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Vec<MandateId> {
        self.transition_where(MandateStatus::Expired, |m| m.timestamp < cutoff)
    }

    /// Cancel every active mandate emitted by `source_id`
    pub fn remove_source(&self, source_id: &str) -> Vec<MandateId> {
        self.transition_where(MandateStatus::Cancelled, |m| m.source_id == source_id)
    }

    fn transition_where(
        &self,
        status: MandateStatus,
        predicate: impl Fn(&Mandate) -> bool,
    ) -> Vec<MandateId> {
        let mut changed = Vec::new();
        for mut entry in self.mandates.iter_mut() {
            if entry.is_active() && predicate(entry.value()) {
                entry.status = status;
                changed.push(entry.id);
            }
        }
        changed.sort();
        changed
    }

    /// Drop mandates that can no longer take part in arbitration
    pub fn purge_inactive(&self) -> usize {
        let inactive: Vec<(MandateId, Symbol)> = self
            .mandates
            .iter()
            .filter(|m| !m.is_active())
            .map(|m| (m.id, m.symbol.clone()))
            .collect();

        for (id, symbol) in &inactive {
            if let Some(mut ids) = self.by_symbol.get_mut(symbol) {
                ids.remove(id);
            }
            self.mandates.remove(id);
        }
        self.by_symbol.retain(|_, ids| !ids.is_empty());
        inactive.len()
    }

    pub fn len(&self) -> usize {
        self.mandates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mandates.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.mandates.iter().filter(|m| m.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, MandateKind};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_register_and_query_by_symbol() {
        let registry = MandateRegistry::new();
        registry
            .register(Mandate::entry("BTC", "trend", Direction::Long, dec!(1)))
            .unwrap();
        registry
            .register(Mandate::new("ETH", MandateKind::Exit, "risk"))
            .unwrap();

        assert_eq!(registry.active_by_symbol(&Symbol::from("BTC")).len(), 1);
        assert_eq!(registry.active_by_symbol(&Symbol::from("SOL")).len(), 0);
        assert_eq!(
            registry.symbols_with_active(),
            vec![Symbol::from("BTC"), Symbol::from("ETH")]
        );
    }

    #[test]
    fn test_duplicate_and_invalid_are_rejected() {
        let registry = MandateRegistry::new();
        let m = Mandate::new("BTC", MandateKind::Hold, "s");
        registry.register(m.clone()).unwrap();
        assert!(matches!(
            registry.register(m),
            Err(ArbiterError::DuplicateMandate(_))
        ));
        assert!(matches!(
            registry.register(Mandate::new("", MandateKind::Hold, "s")),
            Err(ArbiterError::InvalidMandate(_))
        ));
    }

    #[test]
    fn test_update_state_only_from_active() {
        let registry = MandateRegistry::new();
        let m = Mandate::new("BTC", MandateKind::Exit, "s");
        let id = m.id;
        registry.register(m).unwrap();

        let updated = registry.update_state(id, MandateStatus::Consumed).unwrap();
        assert_eq!(updated.status, MandateStatus::Consumed);
        assert!(registry.active_by_symbol(&Symbol::from("BTC")).is_empty());
        assert!(registry.update_state(id, MandateStatus::Cancelled).is_err());
        assert!(matches!(
            registry.update_state(uuid::Uuid::new_v4(), MandateStatus::Cancelled),
            Err(ArbiterError::UnknownMandate(_))
        ));
    }

    #[test]
    fn test_expire_remove_and_purge() {
        let registry = MandateRegistry::new();
        let now = Utc::now();
        let old = Mandate::new("BTC", MandateKind::Hold, "a").at(now - Duration::seconds(60));
        let fresh = Mandate::new("BTC", MandateKind::Hold, "b").at(now);
        let other = Mandate::new("ETH", MandateKind::Hold, "b").at(now);
        let old_id = old.id;
        registry.register(old).unwrap();
        registry.register(fresh).unwrap();
        registry.register(other).unwrap();

        assert_eq!(
            registry.expire_older_than(now - Duration::seconds(30)),
            vec![old_id]
        );
        assert_eq!(registry.remove_source("b").len(), 2);
        assert_eq!(registry.active_count(), 0);

        assert_eq!(registry.purge_inactive(), 3);
        assert!(registry.is_empty());
        assert!(registry.symbols_with_active().is_empty());
    }
}
