//! Position store interface and the in-memory reference store

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{Position, Symbol};
use crate::error::Result;

/// Durable copy of the position book, written at transition boundaries
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persist the latest value of one position (replacing any previous one)
    async fn save(&self, position: &Position) -> Result<()>;

    /// Every persisted position, in symbol order
    async fn load_all(&self) -> Result<Vec<Position>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: DashMap<Symbol, Position>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn save(&self, position: &Position) -> Result<()> {
        self.positions
            .insert(position.symbol().clone(), position.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Position>> {
        let mut positions: Vec<Position> =
            self.positions.iter().map(|p| p.value().clone()).collect();
        positions.sort_by(|a, b| a.symbol().cmp(b.symbol()));
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_save_replaces_previous_value() {
        let store = MemoryStore::new();
        let symbol = Symbol::from("BTC");
        store.save(&Position::flat(symbol.clone())).await.unwrap();
        store
            .save(&Position::open(symbol.clone(), Direction::Long, dec!(2), dec!(10)).unwrap())
            .await
            .unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].quantity(), dec!(2));
    }
}
