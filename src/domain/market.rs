use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Tradable instrument identifier (e.g. "BTC-PERP")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Symbol {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Get the opposite direction
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Direction {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Direction::Long),
            "SHORT" | "SELL" => Ok(Direction::Short),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// Mark price and exchange-reported liquidation price for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    /// Current mark price
    pub mark_price: Decimal,
    /// Liquidation price of the account's position, when the exchange reports one
    #[serde(default)]
    pub liquidation_price: Option<Decimal>,
}

impl MarketQuote {
    pub fn new(mark_price: Decimal) -> Self {
        Self {
            mark_price,
            liquidation_price: None,
        }
    }

    pub fn with_liquidation(mut self, liquidation_price: Decimal) -> Self {
        self.liquidation_price = Some(liquidation_price);
        self
    }
}

/// Account-level balances as reported by the observation feed
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountState {
    /// Total account equity (collateral plus unrealized PnL)
    pub equity: Decimal,
}

impl AccountState {
    pub fn new(equity: Decimal) -> Self {
        Self { equity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse() {
        assert_eq!(Direction::try_from("long").unwrap(), Direction::Long);
        assert_eq!(Direction::try_from("SELL").unwrap(), Direction::Short);
        assert!(Direction::try_from("sideways").is_err());
        assert_eq!(Direction::Long.opposite(), Direction::Short);
    }

    #[test]
    fn test_symbol_ordering_is_lexicographic() {
        let mut symbols = vec![Symbol::from("ETH"), Symbol::from("BTC"), Symbol::from("SOL")];
        symbols.sort();
        assert_eq!(symbols[0].as_str(), "BTC");
        assert!(Symbol::from("  ").is_empty());
    }
}
