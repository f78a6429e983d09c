//! Position Book - 倉位簿
//!
//! Owns the single position per symbol. Each symbol's entry is guarded by its
//! own shard lock, so applying an event for one symbol never waits on another.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::{Position, PositionEvent, PositionState, StateTransition, Symbol};
use crate::error::{ArbiterError, Result};

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: DashMap<Symbol, Position>,
    transitions: AtomicU64,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a lifecycle event to `symbol`'s position.
    ///
    /// A symbol seen for the first time starts FLAT. The successor position
    /// is computed in full before it replaces the current one; on error the
    /// stored position is unchanged.
    pub fn apply(&self, symbol: &Symbol, event: &PositionEvent) -> Result<StateTransition> {
        let mut entry = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(symbol.clone()));

        let from = entry.state();
        let next = entry.apply(event)?;
        let to = next.state();
        *entry = next;
        drop(entry);

        self.transitions.fetch_add(1, Ordering::Relaxed);
        Ok(StateTransition::new(symbol.clone(), from, to, event))
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Position> {
        self.positions.get(symbol).map(|p| p.value().clone())
    }

    /// Current state, FLAT for symbols never referenced
    pub fn state_of(&self, symbol: &Symbol) -> PositionState {
        self.positions
            .get(symbol)
            .map(|p| p.state())
            .unwrap_or(PositionState::Flat)
    }

    /// Copy of every position keyed by symbol
    pub fn snapshot_all(&self) -> BTreeMap<Symbol, Position> {
        self.positions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Replace the book with positions recovered at startup
    pub fn restore(&self, positions: impl IntoIterator<Item = Position>) -> Result<usize> {
        let mut recovered = BTreeMap::new();
        for position in positions {
            position.check_invariants()?;
            let symbol = position.symbol().clone();
            if recovered.insert(symbol.clone(), position).is_some() {
                return Err(ArbiterError::InvariantViolation {
                    symbol,
                    detail: "more than one position recovered for symbol".to_string(),
                });
            }
        }

        self.positions.clear();
        let count = recovered.len();
        for (symbol, position) in recovered {
            self.positions.insert(symbol, position);
        }
        Ok(count)
    }

    /// Re-check structural invariants of every stored position
    pub fn check_invariants(&self) -> Result<()> {
        for entry in self.positions.iter() {
            entry.value().check_invariants()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Store a position without any checks
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, position: Position) {
        self.positions.insert(position.symbol().clone(), position);
    }
}
