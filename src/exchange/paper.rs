//! Paper venue - 模擬撮合
//!
//! Accepts dispatches, hands them to whoever drives the simulation through a
//! bounded channel, and keeps the resulting positions so startup
//! reconciliation has something to compare against.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::traits::{
    Dispatch, ExecutionOutcome, ExecutionReport, ExecutionVenue, VenueOrder, VenuePosition,
};
use crate::domain::Symbol;
use crate::error::{ArbiterError, Result};

pub struct PaperVenue {
    positions: DashMap<Symbol, VenuePosition>,
    open_orders: DashMap<Uuid, Dispatch>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    fail_next: AtomicBool,
    executed: AtomicU64,
}

impl PaperVenue {
    /// Create a venue and the receiver its dispatches are forwarded to
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Dispatch>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                positions: DashMap::new(),
                open_orders: DashMap::new(),
                dispatch_tx,
                fail_next: AtomicBool::new(false),
                executed: AtomicU64::new(0),
            },
            dispatch_rx,
        )
    }

    pub fn with_positions(self, positions: impl IntoIterator<Item = VenuePosition>) -> Self {
        for position in positions {
            self.positions.insert(position.symbol.clone(), position);
        }
        self
    }

    /// Make the next `execute` call fail as if the submission was refused
    pub fn fail_next_execute(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn position(&self, symbol: &Symbol) -> Option<VenuePosition> {
        self.positions.get(symbol).map(|p| p.value().clone())
    }

    /// Fill `dispatch` completely at `price`
    pub fn fill(&self, dispatch: &Dispatch, price: Decimal) -> ExecutionReport {
        let quantity = match &dispatch.order {
            VenueOrder::Enter { quantity, .. }
            | VenueOrder::Reduce { quantity }
            | VenueOrder::Close { quantity } => *quantity,
            VenueOrder::CancelEntry { target } => return self.cancel(dispatch, *target),
        };
        self.fill_partial(dispatch, quantity, price)
    }

    /// Fill `quantity` of `dispatch` at `price` and close the order
    pub fn fill_partial(
        &self,
        dispatch: &Dispatch,
        quantity: Decimal,
        price: Decimal,
    ) -> ExecutionReport {
        self.open_orders.remove(&dispatch.dispatch_id);

        match &dispatch.order {
            VenueOrder::Enter { direction, .. } => {
                self.positions.insert(
                    dispatch.symbol.clone(),
                    VenuePosition {
                        symbol: dispatch.symbol.clone(),
                        direction: *direction,
                        quantity,
                        entry_price: price,
                    },
                );
            }
            VenueOrder::Reduce { .. } | VenueOrder::Close { .. } => {
                let emptied = match self.positions.get_mut(&dispatch.symbol) {
                    Some(mut held) => {
                        held.quantity = (held.quantity - quantity).max(Decimal::ZERO);
                        held.quantity.is_zero()
                    }
                    None => false,
                };
                if emptied {
                    self.positions.remove(&dispatch.symbol);
                }
            }
            VenueOrder::CancelEntry { target } => return self.cancel(dispatch, *target),
        }

        debug!(symbol = %dispatch.symbol, order = dispatch.order.as_str(), %quantity, %price, "paper fill");
        ExecutionReport::filled(dispatch, quantity, price)
    }

    pub fn reject(&self, dispatch: &Dispatch, reason: impl Into<String>) -> ExecutionReport {
        self.open_orders.remove(&dispatch.dispatch_id);
        ExecutionReport::rejected(dispatch, reason)
    }

    fn cancel(&self, dispatch: &Dispatch, target: Uuid) -> ExecutionReport {
        self.open_orders.remove(&dispatch.dispatch_id);
        self.open_orders.remove(&target);
        ExecutionReport::new(
            target,
            dispatch.symbol.clone(),
            ExecutionOutcome::Cancelled {
                reason: "cancelled on request".to_string(),
            },
        )
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn execute(&self, dispatch: Dispatch) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ArbiterError::Execution(format!(
                "paper venue refused {} for {}",
                dispatch.order.as_str(),
                dispatch.symbol
            )));
        }

        self.executed.fetch_add(1, Ordering::Relaxed);
        self.open_orders
            .insert(dispatch.dispatch_id, dispatch.clone());
        self.dispatch_tx
            .send(dispatch)
            .await
            .map_err(|_| ArbiterError::ChannelClosed("paper venue dispatch"))
    }

    async fn open_positions(&self) -> Result<Vec<VenuePosition>> {
        let mut positions: Vec<VenuePosition> =
            self.positions.iter().map(|p| p.value().clone()).collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }
}
