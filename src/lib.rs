//! arbiter - mandate arbitration and position lifecycle core
//!
//! Many strategies emit mandates for the same symbols at once; each decision
//! cycle resolves them into at most one action per symbol, checks it against
//! hard risk bounds, and drives the symbol's position through its lifecycle.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod persistence;
pub mod platform;
pub mod services;

pub use config::AppConfig;
pub use coordinator::{
    CycleSummary, DecisionOutcome, DecisionRecord, Pipeline, PipelineConfig, PipelineHandle,
};
pub use domain::{
    Action, ActionKind, Direction, HotStateSnapshot, Mandate, MandateKind, Position,
    PositionEvent, PositionState, Symbol,
};
pub use error::{ArbiterError, Result, RiskRejection};
pub use exchange::{Dispatch, ExecutionReport, ExecutionVenue, PaperVenue};
pub use persistence::{JsonFileStore, MemoryStore, PositionStore};
pub use platform::{
    arbitrate, HotStateReader, HotStateStore, HotStateWriter, MandateRegistry, ReservationManager,
    RiskConfig, RiskGate, RiskVerdict,
};
pub use services::MonitorView;
