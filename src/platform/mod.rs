//! Decision Platform - 決策核心
//!
//! 熱狀態、指令登記、仲裁、風控、預留與倉位簿。
//! The pipeline in `coordinator` wires these together; each piece is usable
//! on its own.

pub mod arbitrator;
mod book;
mod hot_state;
mod registry;
mod reservation;
mod risk;

pub use arbitrator::{arbitrate, arbitrate_all};
pub use book::PositionBook;
pub use hot_state::{HotStateReader, HotStateStats, HotStateStore, HotStateWriter};
pub use registry::MandateRegistry;
pub use reservation::{
    ReleaseOutcome, ReservationConflict, ReservationManager, ReservationReceipt, ReservationToken,
};
pub use risk::{DeleverageSuggestion, RiskConfig, RiskGate, RiskMetrics, RiskVerdict};
