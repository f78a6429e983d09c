use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Action, Direction, Symbol};
use crate::error::Result;
use crate::platform::ReservationReceipt;

/// Order the venue is asked to work for one symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VenueOrder {
    /// Open a new position
    Enter {
        direction: Direction,
        quantity: Decimal,
    },
    /// Close part of the held position
    Reduce { quantity: Decimal },
    /// Close the whole held position
    Close { quantity: Decimal },
    /// Cancel the in-flight entry identified by `target`
    CancelEntry { target: Uuid },
}

impl VenueOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueOrder::Enter { .. } => "enter",
            VenueOrder::Reduce { .. } => "reduce",
            VenueOrder::Close { .. } => "close",
            VenueOrder::CancelEntry { .. } => "cancel_entry",
        }
    }
}

/// A finalized decision handed to the execution venue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub dispatch_id: Uuid,
    pub symbol: Symbol,
    pub order: VenueOrder,
    /// The action this order carries out
    pub action: Action,
    /// Reservation backing an entry; the token itself stays with the pipeline
    pub reservation: Option<ReservationReceipt>,
    pub created_at: DateTime<Utc>,
}

impl Dispatch {
    pub fn new(action: Action, order: VenueOrder, reservation: Option<ReservationReceipt>) -> Self {
        Self {
            dispatch_id: Uuid::new_v4(),
            symbol: action.symbol.clone(),
            order,
            action,
            reservation,
            created_at: Utc::now(),
        }
    }
}

/// What happened to a dispatched order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Filled { quantity: Decimal, price: Decimal },
    Rejected { reason: String },
    Cancelled { reason: String },
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Filled { .. } => "filled",
            ExecutionOutcome::Rejected { .. } => "rejected",
            ExecutionOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// Venue feedback for one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub dispatch_id: Uuid,
    pub symbol: Symbol,
    pub outcome: ExecutionOutcome,
    pub reported_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn new(dispatch_id: Uuid, symbol: Symbol, outcome: ExecutionOutcome) -> Self {
        Self {
            dispatch_id,
            symbol,
            outcome,
            reported_at: Utc::now(),
        }
    }

    pub fn filled(dispatch: &Dispatch, quantity: Decimal, price: Decimal) -> Self {
        Self::new(
            dispatch.dispatch_id,
            dispatch.symbol.clone(),
            ExecutionOutcome::Filled { quantity, price },
        )
    }

    pub fn rejected(dispatch: &Dispatch, reason: impl Into<String>) -> Self {
        Self::new(
            dispatch.dispatch_id,
            dispatch.symbol.clone(),
            ExecutionOutcome::Rejected {
                reason: reason.into(),
            },
        )
    }
}

/// Position as the venue sees it (source of truth at startup)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: Symbol,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

/// External execution collaborator.
///
/// `execute` only hands the order over; fills, rejects and cancels come back
/// asynchronously through `PipelineHandle::report_execution`.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, dispatch: Dispatch) -> Result<()>;

    async fn open_positions(&self) -> Result<Vec<VenuePosition>>;
}
