use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{PositionState, Symbol};

/// Main error type for the decision core
#[derive(Error, Debug)]
pub enum ArbiterError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // State machine errors
    #[error("Invalid transition for {symbol}: {event} not allowed from {from} ({reason})")]
    InvalidTransition {
        symbol: Symbol,
        from: PositionState,
        event: &'static str,
        reason: String,
    },

    #[error("Invariant violation for {symbol}: {detail}")]
    InvariantViolation { symbol: Symbol, detail: String },

    // Risk errors
    #[error("Risk violation: {0}")]
    RiskViolation(RiskRejection),

    // Hot state errors
    #[error("Stale snapshot: version {version} is {age_ms}ms old (max {max_age_ms}ms)")]
    StaleSnapshot {
        version: u64,
        age_ms: u64,
        max_age_ms: u64,
    },

    // Mandate errors
    #[error("Duplicate mandate: {0}")]
    DuplicateMandate(Uuid),

    #[error("Unknown mandate: {0}")]
    UnknownMandate(Uuid),

    #[error("Invalid mandate: {0}")]
    InvalidMandate(String),

    // Pipeline errors
    #[error("Pipeline halted: {0}")]
    Halted(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Pipeline stage stopped: {0}")]
    StageStopped(String),

    #[error("Execution error: {0}")]
    Execution(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ArbiterError {
    /// Errors after which the process must stop acting on its state
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArbiterError::InvariantViolation { .. }
                | ArbiterError::Halted(_)
                | ArbiterError::StageStopped(_)
        )
    }
}

/// Result type alias for ArbiterError
pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Reasons the risk gate refuses an action
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RiskRejection {
    #[error("Account equity is not positive: {equity}")]
    NonPositiveEquity { equity: Decimal },

    #[error("No mark price for {symbol}")]
    MissingMarkPrice { symbol: Symbol },

    #[error("Invalid quantity for {symbol}: {quantity}")]
    InvalidQuantity { symbol: Symbol, quantity: Decimal },

    #[error("Leverage would reach {projected} > limit {limit}")]
    LeverageExceeded { projected: Decimal, limit: Decimal },

    #[error("Exposure on {symbol} would reach {projected} > limit {limit}")]
    SymbolExposureExceeded {
        symbol: Symbol,
        projected: Decimal,
        limit: Decimal,
    },

    #[error("Margin available would fall to {available}")]
    InsufficientMargin { available: Decimal },

    #[error("Exposure on {symbol} is outside the representable range")]
    ExposureOverflow { symbol: Symbol },
}

impl RiskRejection {
    /// Machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            RiskRejection::NonPositiveEquity { .. } => "non_positive_equity",
            RiskRejection::MissingMarkPrice { .. } => "missing_mark_price",
            RiskRejection::InvalidQuantity { .. } => "invalid_quantity",
            RiskRejection::LeverageExceeded { .. } => "leverage_exceeded",
            RiskRejection::SymbolExposureExceeded { .. } => "symbol_exposure_exceeded",
            RiskRejection::InsufficientMargin { .. } => "insufficient_margin",
            RiskRejection::ExposureOverflow { .. } => "exposure_overflow",
        }
    }
}

impl From<RiskRejection> for ArbiterError {
    fn from(err: RiskRejection) -> Self {
        ArbiterError::RiskViolation(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rejection_code_matches_serialized_tag() {
        let rejection = RiskRejection::LeverageExceeded {
            projected: dec!(10.5),
            limit: dec!(10),
        };
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["code"], rejection.code());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ArbiterError::Halted("x".into()).is_fatal());
        assert!(ArbiterError::StageStopped("gate stage".into()).is_fatal());
        assert!(!ArbiterError::InvalidMandate("x".into()).is_fatal());
        assert!(!ArbiterError::ChannelClosed("pipeline command").is_fatal());
    }
}
