//! Decision Pipeline
//!
//! Wires the hot state, mandate registry, arbitrator, risk gate, reservation
//! manager and position book into a staged, message-passing decision loop
//! with a single control surface for strategies, the venue and operators.

pub mod aging;
pub mod command;
pub mod config;
pub mod halt;
pub mod pipeline;
pub mod state;

pub use aging::AgingPolicy;
pub use command::PipelineCommand;
pub use config::PipelineConfig;
pub use halt::{Halt, HaltReason, HaltState};
pub(crate) use pipeline::PipelineShared;
pub use pipeline::{Pipeline, PipelineHandle};
pub use state::{
    CycleSummary, DecisionOutcome, DecisionRecord, PipelineStats, PipelineStatsSnapshot,
    RiskSnapshot,
};
