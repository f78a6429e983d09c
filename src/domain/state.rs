use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Direction, MandateKind, Symbol};
use crate::error::{ArbiterError, Result};

/// Position lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    /// No exposure and nothing in flight
    Flat,
    /// Entry order submitted, waiting for fill
    Entering,
    /// Holding exposure
    Open,
    /// Reduce order submitted, waiting for fill
    Reducing,
    /// Close order submitted, waiting for fill
    Closing,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Flat => "FLAT",
            PositionState::Entering => "ENTERING",
            PositionState::Open => "OPEN",
            PositionState::Reducing => "REDUCING",
            PositionState::Closing => "CLOSING",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: PositionState) -> bool {
        use PositionState::*;

        match (self, target) {
            (Flat, Entering) => true,

            (Entering, Open) => true, // Fill confirmed
            (Entering, Flat) => true, // Cancelled or rejected

            (Open, Reducing) => true,
            (Open, Closing) => true,

            (Reducing, Open) => true, // Partial reduction filled
            (Reducing, Flat) => true, // Reduction took the whole position

            (Closing, Flat) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<PositionState> {
        use PositionState::*;

        match self {
            Flat => vec![Entering],
            Entering => vec![Open, Flat],
            Open => vec![Reducing, Closing],
            Reducing => vec![Open, Flat],
            Closing => vec![Flat],
        }
    }

    /// Mandate kinds that may take part in arbitration while in this state.
    ///
    /// EXIT while ENTERING asks the venue to cancel the pending entry; the
    /// position returns to FLAT through the cancel/reject edge.
    pub fn admits(&self, kind: MandateKind) -> bool {
        use MandateKind::*;
        use PositionState::*;

        match (self, kind) {
            (Flat, Entry | Block | Hold) => true,
            (Entering, Exit | Block) => true,
            (Open, Exit | Block | Reduce | Hold) => true,
            (Reducing, Block | Hold) => true,
            (Closing, Block | Hold) => true,
            _ => false,
        }
    }

    /// Event names [`Position::apply`] handles from this state
    pub fn accepted_events(&self) -> &'static [&'static str] {
        match self {
            PositionState::Flat => &["entry_admitted"],
            PositionState::Entering => &["filled", "failed"],
            PositionState::Open => &["reduce_admitted", "exit_admitted"],
            PositionState::Reducing | PositionState::Closing => &["filled"],
        }
    }

    /// Does this state hold filled exposure?
    pub fn has_exposure(&self) -> bool {
        matches!(
            self,
            PositionState::Open | PositionState::Reducing | PositionState::Closing
        )
    }

    /// Is an order for this symbol waiting on the venue?
    pub fn has_pending_order(&self) -> bool {
        matches!(
            self,
            PositionState::Entering | PositionState::Reducing | PositionState::Closing
        )
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PositionState {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(PositionState::Flat),
            "ENTERING" => Ok(PositionState::Entering),
            "OPEN" => Ok(PositionState::Open),
            "REDUCING" => Ok(PositionState::Reducing),
            "CLOSING" => Ok(PositionState::Closing),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// Inputs that drive the position lifecycle: admitted actions and venue feedback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionEvent {
    /// An ENTRY passed arbitration, risk and reservation
    EntryAdmitted { direction: Direction, quantity: Decimal },
    /// A REDUCE passed arbitration and risk
    ReduceAdmitted { quantity: Decimal },
    /// An EXIT (strategy or forced) passed arbitration and risk
    ExitAdmitted,
    /// The venue filled the in-flight order
    Filled { quantity: Decimal, price: Decimal },
    /// The venue cancelled or rejected the in-flight order
    Failed { reason: String },
}

impl PositionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PositionEvent::EntryAdmitted { .. } => "entry_admitted",
            PositionEvent::ReduceAdmitted { .. } => "reduce_admitted",
            PositionEvent::ExitAdmitted => "exit_admitted",
            PositionEvent::Filled { .. } => "filled",
            PositionEvent::Failed { .. } => "failed",
        }
    }
}

/// One position per symbol.
///
/// Fields are private: the only way to change a position is [`Position::apply`],
/// which computes the whole successor value before anything is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    symbol: Symbol,
    state: PositionState,
    direction: Option<Direction>,
    /// Filled quantity, always non-negative
    quantity: Decimal,
    entry_price: Option<Decimal>,
    /// Quantity of the order currently in flight
    pending_quantity: Decimal,
    updated_at: DateTime<Utc>,
}

impl Position {
    /// FLAT position; the only constructor used for transitions into FLAT
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            state: PositionState::Flat,
            direction: None,
            quantity: Decimal::ZERO,
            entry_price: None,
            pending_quantity: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// OPEN position built from venue truth during reconciliation
    pub fn open(
        symbol: Symbol,
        direction: Direction,
        quantity: Decimal,
        entry_price: Decimal,
    ) -> Result<Self> {
        let position = Self {
            symbol,
            state: PositionState::Open,
            direction: Some(direction),
            quantity,
            entry_price: Some(entry_price),
            pending_quantity: Decimal::ZERO,
            updated_at: Utc::now(),
        };
        position.check_invariants()?;
        Ok(position)
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn entry_price(&self) -> Option<Decimal> {
        self.entry_price
    }

    pub fn pending_quantity(&self) -> Decimal {
        self.pending_quantity
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_flat(&self) -> bool {
        self.state == PositionState::Flat
    }

    /// Signed quantity (negative for shorts)
    pub fn signed_quantity(&self) -> Decimal {
        match self.direction {
            Some(Direction::Short) => -self.quantity,
            _ => self.quantity,
        }
    }

    /// Compute the successor position for `event`.
    ///
    /// Returns `InvalidTransition` for every (state, event) pair outside the
    /// transition table; `self` is never modified.
    pub fn apply(&self, event: &PositionEvent) -> Result<Position> {
        use PositionEvent::*;
        use PositionState::*;

        let next = match (self.state, event) {
            (Flat, EntryAdmitted { direction, quantity }) => {
                self.require_positive(event, *quantity, "entry quantity")?;
                Position {
                    state: Entering,
                    direction: Some(*direction),
                    quantity: Decimal::ZERO,
                    entry_price: None,
                    pending_quantity: *quantity,
                    ..self.touched()
                }
            }

            (Entering, Filled { quantity, price }) => {
                self.require_positive(event, *quantity, "fill quantity")?;
                self.require_positive(event, *price, "fill price")?;
                if *quantity > self.pending_quantity {
                    return Err(self.invalid(
                        event,
                        format!(
                            "fill {} exceeds requested entry {}",
                            quantity, self.pending_quantity
                        ),
                    ));
                }
                Position {
                    state: Open,
                    quantity: *quantity,
                    entry_price: Some(*price),
                    pending_quantity: Decimal::ZERO,
                    ..self.touched()
                }
            }

            (Entering, Failed { .. }) => Position::flat(self.symbol.clone()),

            (Open, ReduceAdmitted { quantity }) => {
                self.require_positive(event, *quantity, "reduce quantity")?;
                if *quantity > self.quantity {
                    return Err(self.invalid(
                        event,
                        format!("reduce {} exceeds held {}", quantity, self.quantity),
                    ));
                }
                Position {
                    state: Reducing,
                    pending_quantity: *quantity,
                    ..self.touched()
                }
            }

            (Open, ExitAdmitted) => Position {
                state: Closing,
                pending_quantity: self.quantity,
                ..self.touched()
            },

            (Reducing, Filled { quantity, .. }) => {
                if quantity.is_sign_negative() {
                    return Err(self.invalid(event, format!("negative fill {}", quantity)));
                }
                if *quantity > self.quantity {
                    return Err(self.invalid(
                        event,
                        format!("fill {} exceeds held {}", quantity, self.quantity),
                    ));
                }
                let remaining = self.quantity - *quantity;
                if remaining.is_zero() {
                    Position::flat(self.symbol.clone())
                } else {
                    Position {
                        state: Open,
                        quantity: remaining,
                        pending_quantity: Decimal::ZERO,
                        ..self.touched()
                    }
                }
            }

            (Closing, Filled { quantity, .. }) => {
                if *quantity != self.quantity {
                    return Err(self.invalid(
                        event,
                        format!(
                            "close fill {} does not match held {}",
                            quantity, self.quantity
                        ),
                    ));
                }
                Position::flat(self.symbol.clone())
            }

            _ => {
                return Err(self.invalid(
                    event,
                    format!(
                        "{} does not accept {} (accepts: {})",
                        self.state,
                        event.name(),
                        self.state.accepted_events().join(", ")
                    ),
                ));
            }
        };

        debug_assert!(self.state.can_transition_to(next.state));
        next.check_invariants()?;
        Ok(next)
    }

    /// Structural invariants; a violation is fatal for the process
    pub fn check_invariants(&self) -> Result<()> {
        use PositionState::*;

        let violation = |detail: &str| {
            Err(ArbiterError::InvariantViolation {
                symbol: self.symbol.clone(),
                detail: format!("{} ({:?})", detail, self),
            })
        };

        if self.quantity.is_sign_negative() || self.pending_quantity.is_sign_negative() {
            return violation("negative quantity");
        }

        let flat_shape = self.quantity.is_zero() && self.direction.is_none();
        if (self.state == Flat) != flat_shape {
            return violation("FLAT must coincide with zero quantity and no direction");
        }

        match self.state {
            Flat => {
                if !self.pending_quantity.is_zero() || self.entry_price.is_some() {
                    return violation("FLAT position carries order state");
                }
            }
            Entering => {
                if !self.quantity.is_zero() || self.pending_quantity.is_zero() {
                    return violation("ENTERING requires zero filled and positive pending");
                }
            }
            Open => {
                if self.quantity.is_zero() || self.direction.is_none() || self.entry_price.is_none()
                {
                    return violation("OPEN requires quantity, direction and entry price");
                }
                if !self.pending_quantity.is_zero() {
                    return violation("OPEN position has an order in flight");
                }
            }
            Reducing | Closing => {
                if self.quantity.is_zero() || self.direction.is_none() {
                    return violation("exposure state without quantity or direction");
                }
                if self.pending_quantity.is_zero() || self.pending_quantity > self.quantity {
                    return violation("pending order outside held quantity");
                }
            }
        }
        Ok(())
    }

    fn touched(&self) -> Position {
        Position {
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    fn require_positive(&self, event: &PositionEvent, value: Decimal, what: &str) -> Result<()> {
        if value > Decimal::ZERO {
            Ok(())
        } else {
            Err(self.invalid(event, format!("{} must be positive, got {}", what, value)))
        }
    }

    fn invalid(&self, event: &PositionEvent, reason: String) -> ArbiterError {
        ArbiterError::InvalidTransition {
            symbol: self.symbol.clone(),
            from: self.state,
            event: event.name(),
            reason,
        }
    }
}

/// State transition event (for logging/auditing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub symbol: Symbol,
    pub from: PositionState,
    pub to: PositionState,
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(symbol: Symbol, from: PositionState, to: PositionState, event: &PositionEvent) -> Self {
        Self {
            symbol,
            from,
            to,
            event: event.name().to_string(),
            timestamp: Utc::now(),
        }
    }
}
