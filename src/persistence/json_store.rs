//! JSON file position store
//!
//! The whole book is rewritten on every save: serialized to a sibling temp
//! file, then renamed over the target so a crash never leaves a torn file.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::store::PositionStore;
use crate::domain::{Position, Symbol};
use crate::error::{ArbiterError, Result};

pub struct JsonFileStore {
    path: PathBuf,
    cache: DashMap<Symbol, Position>,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`, loading what is there
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            cache: DashMap::new(),
            write_lock: Mutex::new(()),
        };
        for position in store.read_file().await? {
            store.cache.insert(position.symbol().clone(), position);
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<Vec<Position>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ArbiterError::Persistence(format!("{}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn sorted(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.cache.iter().map(|p| p.value().clone()).collect();
        positions.sort_by(|a, b| a.symbol().cmp(b.symbol()));
        positions
    }
}

#[async_trait]
impl PositionStore for JsonFileStore {
    async fn save(&self, position: &Position) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.cache
            .insert(position.symbol().clone(), position.clone());

        let bytes = serde_json::to_vec_pretty(&self.sorted())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(symbol = %position.symbol(), path = %self.path.display(), "position persisted");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Position>> {
        Ok(self.sorted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use rust_decimal_macros::dec;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("arbiter-store-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_positions_survive_reopen() {
        let path = temp_path();
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store
                .save(&Position::open(Symbol::from("ETH"), Direction::Short, dec!(4), dec!(2500)).unwrap())
                .await
                .unwrap();
            store.save(&Position::flat(Symbol::from("BTC"))).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].symbol().as_str(), "BTC");
        assert_eq!(all[1].quantity(), dec!(4));
        assert_eq!(all[1].direction(), Some(Direction::Short));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let store = JsonFileStore::open(temp_path()).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let path = temp_path();
        std::fs::write(&path, b"{not json").unwrap();
        let result = JsonFileStore::open(&path).await;
        assert!(matches!(result, Err(ArbiterError::Persistence(_))));
        let _ = std::fs::remove_file(&path);
    }
}
