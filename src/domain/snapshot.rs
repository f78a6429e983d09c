use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{AccountState, MarketQuote, Position, Symbol};

/// Immutable, versioned point-in-time view of market and account data.
///
/// `version` is stamped by the hot state store at publish time; values built
/// by observation carry whatever placeholder they were constructed with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotStateSnapshot {
    pub version: u64,
    pub published_at: DateTime<Utc>,
    pub account: AccountState,
    pub prices: BTreeMap<Symbol, MarketQuote>,
    pub positions: BTreeMap<Symbol, Position>,
}

impl HotStateSnapshot {
    pub fn new(account: AccountState) -> Self {
        Self {
            version: 0,
            published_at: Utc::now(),
            account,
            prices: BTreeMap::new(),
            positions: BTreeMap::new(),
        }
    }

    pub fn with_quote(mut self, symbol: impl Into<Symbol>, quote: MarketQuote) -> Self {
        self.prices.insert(symbol.into(), quote);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.insert(position.symbol().clone(), position);
        self
    }

    pub fn quote(&self, symbol: &Symbol) -> Option<&MarketQuote> {
        self.prices.get(symbol)
    }

    /// Age in milliseconds relative to `now`
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.published_at).num_milliseconds().max(0) as u64
    }
}
