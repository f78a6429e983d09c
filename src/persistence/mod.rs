//! Persistence Layer for position recovery
//!
//! - `PositionStore` trait written at every transition boundary
//! - In-memory and JSON file stores
//! - Startup reconciliation against the execution venue

mod json_store;
mod reconcile;
mod store;

pub use json_store::JsonFileStore;
pub use reconcile::{reconcile, ReconcileReport};
pub use store::{MemoryStore, PositionStore};
