//! Trading intents emitted by strategies

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Direction, Symbol};
use crate::error::{ArbiterError, Result};

/// Largest quantity a strategy may request
pub const MAX_MANDATE_QUANTITY: Decimal = dec!(1000000000000);

/// Mandate identifier
pub type MandateId = Uuid;

/// Kind of trading intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MandateKind {
    Exit,
    Block,
    Reduce,
    Entry,
    Hold,
}

impl MandateKind {
    pub const ALL: [MandateKind; 5] = [
        MandateKind::Exit,
        MandateKind::Block,
        MandateKind::Reduce,
        MandateKind::Entry,
        MandateKind::Hold,
    ];

    /// Fixed arbitration rank: EXIT(5) > BLOCK(4) > REDUCE(3) > ENTRY(2) > HOLD(1)
    pub fn rank(&self) -> u8 {
        match self {
            MandateKind::Exit => 5,
            MandateKind::Block => 4,
            MandateKind::Reduce => 3,
            MandateKind::Entry => 2,
            MandateKind::Hold => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MandateKind::Exit => "EXIT",
            MandateKind::Block => "BLOCK",
            MandateKind::Reduce => "REDUCE",
            MandateKind::Entry => "ENTRY",
            MandateKind::Hold => "HOLD",
        }
    }
}

impl std::fmt::Display for MandateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MandateKind {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.trim().to_uppercase().as_str() {
            "EXIT" => Ok(MandateKind::Exit),
            "BLOCK" => Ok(MandateKind::Block),
            "REDUCE" => Ok(MandateKind::Reduce),
            "ENTRY" => Ok(MandateKind::Entry),
            "HOLD" => Ok(MandateKind::Hold),
            _ => Err(format!("Unknown mandate kind: {}", s)),
        }
    }
}

/// Registry-managed lifecycle of a mandate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MandateStatus {
    /// Eligible for arbitration
    Active,
    /// Won arbitration and was dispatched
    Consumed,
    /// Won arbitration but was refused by the risk gate
    Rejected,
    /// Withdrawn by its source
    Cancelled,
    /// Outlived its time-to-live
    Expired,
}

impl MandateStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, MandateStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MandateStatus::Active => "ACTIVE",
            MandateStatus::Consumed => "CONSUMED",
            MandateStatus::Rejected => "REJECTED",
            MandateStatus::Cancelled => "CANCELLED",
            MandateStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for MandateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A strategy's requested trading intent for one symbol.
///
/// Everything except `status` is fixed at emission. `status` is owned by the
/// mandate registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mandate {
    pub id: MandateId,
    pub symbol: Symbol,
    pub kind: MandateKind,
    /// Priority supplied by the emitting strategy (higher wins within a kind)
    pub authority: u32,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    /// Requested direction (required for ENTRY)
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Requested quantity (ENTRY/REDUCE size; ignored for EXIT/BLOCK/HOLD)
    #[serde(default)]
    pub quantity: Decimal,
    pub status: MandateStatus,
}

impl Mandate {
    pub fn new(symbol: impl Into<Symbol>, kind: MandateKind, source_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            kind,
            authority: 0,
            timestamp: Utc::now(),
            source_id: source_id.into(),
            direction: None,
            quantity: Decimal::ZERO,
            status: MandateStatus::Active,
        }
    }

    /// ENTRY mandate for `quantity` units in `direction`
    pub fn entry(
        symbol: impl Into<Symbol>,
        source_id: impl Into<String>,
        direction: Direction,
        quantity: Decimal,
    ) -> Self {
        Self::new(symbol, MandateKind::Entry, source_id)
            .with_direction(direction)
            .with_quantity(quantity)
    }

    pub fn with_authority(mut self, authority: u32) -> Self {
        self.authority = authority;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_id(mut self, id: MandateId) -> Self {
        self.id = id;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Age in milliseconds relative to `now` (zero for mandates stamped in the future)
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.timestamp).num_milliseconds().max(0) as u64
    }

    /// Structural validation of an untrusted mandate
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(ArbiterError::InvalidMandate(format!(
                "{}: empty symbol",
                self.id
            )));
        }
        if self.source_id.trim().is_empty() {
            return Err(ArbiterError::InvalidMandate(format!(
                "{}: empty source_id",
                self.id
            )));
        }
        if self.quantity.is_sign_negative() {
            return Err(ArbiterError::InvalidMandate(format!(
                "{}: negative quantity {}",
                self.id, self.quantity
            )));
        }
        if self.quantity > MAX_MANDATE_QUANTITY {
            return Err(ArbiterError::InvalidMandate(format!(
                "{}: quantity {} above limit {}",
                self.id, self.quantity, MAX_MANDATE_QUANTITY
            )));
        }
        if !self.is_active() {
            return Err(ArbiterError::InvalidMandate(format!(
                "{}: submitted with status {}",
                self.id, self.status
            )));
        }
        match self.kind {
            MandateKind::Entry => {
                if self.direction.is_none() {
                    return Err(ArbiterError::InvalidMandate(format!(
                        "{}: ENTRY requires a direction",
                        self.id
                    )));
                }
                if self.quantity.is_zero() {
                    return Err(ArbiterError::InvalidMandate(format!(
                        "{}: ENTRY requires a positive quantity",
                        self.id
                    )));
                }
            }
            MandateKind::Reduce => {
                if self.quantity.is_zero() {
                    return Err(ArbiterError::InvalidMandate(format!(
                        "{}: REDUCE requires a positive quantity",
                        self.id
                    )));
                }
            }
            MandateKind::Exit | MandateKind::Block | MandateKind::Hold => {}
        }
        Ok(())
    }
}
