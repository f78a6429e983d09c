//! Pipeline Commands - 管線指令

use tokio::sync::oneshot;

use super::state::CycleSummary;
use crate::domain::StateTransition;
use crate::error::Result;
use crate::exchange::ExecutionReport;

#[derive(Debug)]
pub enum PipelineCommand {
    /// Run one decision cycle now and reply with its summary
    TriggerCycle {
        reply: oneshot::Sender<Result<CycleSummary>>,
    },
    /// Venue feedback for a dispatched order
    Report {
        report: ExecutionReport,
        reply: Option<oneshot::Sender<Result<Option<StateTransition>>>>,
    },
    /// Graceful stop after the current command
    Shutdown,
}
