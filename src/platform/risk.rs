//! Risk Gate - 風控閘門
//!
//! Pure leverage, margin and liquidation-distance checks run on every
//! arbitrated action before it may reach the execution venue:
//! - 槓桿 `L = Σ|Q × P_mark| / E`
//! - 保證金 `E − Σ IM`, `IM = |Q × P_mark| × MMR`
//! - 強平距離 `D = |P_mark − P_liq| / P_mark`
//!
//! Nothing in this module logs, reads a clock, or touches shared state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{
    AccountState, Action, ActionKind, Direction, MarketQuote, Position, PositionState, Symbol,
};
use crate::error::{ArbiterError, Result, RiskRejection};

/// 風控配置 (validated once at startup, never mutated afterwards)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Hard account leverage ceiling
    pub l_max: Decimal,
    /// Leverage that deleverage suggestions aim for
    pub l_target: Decimal,
    /// Per-symbol exposure ceiling as a multiple of equity
    pub l_symbol_max: Decimal,
    /// Liquidation distance below which new entries are refused
    pub d_min_safe: Decimal,
    /// Liquidation distance below which the position is force-exited
    pub d_critical: Decimal,
    /// Margin rate applied to notional exposure
    pub mmr: Decimal,
    /// Minimum fraction of a position each deleverage suggestion removes
    pub reduction_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            l_max: Decimal::from(10),
            l_target: Decimal::from(5),
            l_symbol_max: Decimal::from(3),
            d_min_safe: Decimal::new(10, 2),   // 10%
            d_critical: Decimal::new(5, 2),    // 5%
            mmr: Decimal::new(5, 3),           // 0.5%
            reduction_pct: Decimal::new(25, 2), // 25%
        }
    }
}

impl RiskConfig {
    /// Check that the constants are mutually consistent
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.l_max <= Decimal::ZERO {
            errors.push("l_max must be positive".to_string());
        }
        if self.l_target <= Decimal::ZERO || self.l_target > self.l_max {
            errors.push("l_target must be in (0, l_max]".to_string());
        }
        if self.l_symbol_max <= Decimal::ZERO || self.l_symbol_max > self.l_max {
            errors.push("l_symbol_max must be in (0, l_max]".to_string());
        }
        if self.d_critical <= Decimal::ZERO || self.d_critical >= self.d_min_safe {
            errors.push("d_critical must be in (0, d_min_safe)".to_string());
        }
        if self.d_min_safe >= Decimal::ONE {
            errors.push("d_min_safe must be below 1".to_string());
        }
        if self.mmr <= Decimal::ZERO || self.mmr >= Decimal::ONE {
            errors.push("mmr must be in (0, 1)".to_string());
        }
        if self.reduction_pct <= Decimal::ZERO || self.reduction_pct > Decimal::ONE {
            errors.push("reduction_pct must be in (0, 1]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArbiterError::InvalidConfig(errors.join("; ")))
        }
    }
}

/// 風控檢查結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RiskVerdict {
    /// The action may proceed
    Accept,
    /// The action is refused; the reason is never empty
    Reject(RiskRejection),
    /// Replace whatever was arbitrated with an EXIT for `symbol`
    ForceExit { symbol: Symbol, distance: Decimal },
}

impl RiskVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RiskVerdict::Accept)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, RiskVerdict::Reject(_))
    }
}

/// Point-in-time account risk figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub equity: Decimal,
    /// Σ|Q × P_mark| over held and pending exposure
    pub gross_exposure: Decimal,
    /// None when equity is not positive
    pub leverage: Option<Decimal>,
    pub margin_used: Decimal,
    pub margin_available: Decimal,
    /// Liquidation distance per symbol with filled exposure and a mark price
    pub liquidation_distance: BTreeMap<Symbol, Decimal>,
    /// Symbols whose distance is below `d_min_safe`
    pub below_min_safe: Vec<Symbol>,
    /// Symbols whose distance is below `d_critical`
    pub below_critical: Vec<Symbol>,
    /// Symbols with exposure but no mark price
    pub unpriced: Vec<Symbol>,
}

/// Advisory REDUCE bringing leverage back toward `l_target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleverageSuggestion {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub exposure_reduction: Decimal,
}

/// 風控閘門
#[derive(Debug, Clone)]
pub struct RiskGate {
    config: Arc<RiskConfig>,
}

impl RiskGate {
    pub fn new(config: Arc<RiskConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Validate one arbitrated action against the current account state.
    ///
    /// A critical liquidation distance on the action's own symbol overrides
    /// the action with `ForceExit`. Only ENTRY can be rejected; REDUCE, EXIT,
    /// HOLD and NoAction only ever lower risk.
    pub fn validate(
        &self,
        action: &Action,
        account: &AccountState,
        positions: &BTreeMap<Symbol, Position>,
        prices: &BTreeMap<Symbol, MarketQuote>,
    ) -> RiskVerdict {
        if action.kind != ActionKind::Exit {
            if let Some(position) = positions.get(&action.symbol) {
                if let Some(distance) = self.distance_for(position, account, positions, prices) {
                    if distance < self.config.d_critical {
                        return RiskVerdict::ForceExit {
                            symbol: action.symbol.clone(),
                            distance,
                        };
                    }
                }
            }
        }

        match action.kind {
            ActionKind::Entry => match self.check_entry(action, account, positions, prices) {
                Ok(()) => RiskVerdict::Accept,
                Err(rejection) => RiskVerdict::Reject(rejection),
            },
            ActionKind::Exit | ActionKind::Reduce | ActionKind::Hold | ActionKind::NoAction => {
                RiskVerdict::Accept
            }
        }
    }

    /// Every symbol with filled exposure whose liquidation distance is below
    /// `d_critical`, in symbol order
    pub fn scan_liquidation(
        &self,
        account: &AccountState,
        positions: &BTreeMap<Symbol, Position>,
        prices: &BTreeMap<Symbol, MarketQuote>,
    ) -> Vec<(Symbol, Decimal)> {
        positions
            .values()
            .filter_map(|p| {
                self.distance_for(p, account, positions, prices)
                    .filter(|d| *d < self.config.d_critical)
                    .map(|d| (p.symbol().clone(), d))
            })
            .collect()
    }

    fn check_entry(
        &self,
        action: &Action,
        account: &AccountState,
        positions: &BTreeMap<Symbol, Position>,
        prices: &BTreeMap<Symbol, MarketQuote>,
    ) -> std::result::Result<(), RiskRejection> {
        let equity = account.equity;
        if equity <= Decimal::ZERO {
            return Err(RiskRejection::NonPositiveEquity { equity });
        }

        if action.quantity <= Decimal::ZERO || action.direction.is_none() {
            return Err(RiskRejection::InvalidQuantity {
                symbol: action.symbol.clone(),
                quantity: action.quantity,
            });
        }

        let mark = match prices.get(&action.symbol).map(|q| q.mark_price) {
            Some(mark) if mark > Decimal::ZERO => mark,
            _ => {
                return Err(RiskRejection::MissingMarkPrice {
                    symbol: action.symbol.clone(),
                })
            }
        };

        let exposure = gross_exposure(positions, prices);
        if let Some(symbol) = exposure.overflow {
            return Err(RiskRejection::ExposureOverflow { symbol });
        }
        if let Some(symbol) = exposure.unpriced.into_iter().next() {
            return Err(RiskRejection::MissingMarkPrice { symbol });
        }

        let overflow = || RiskRejection::ExposureOverflow {
            symbol: action.symbol.clone(),
        };
        let added = action.quantity.checked_mul(mark).ok_or_else(overflow)?.abs();
        let projected_gross = exposure.gross.checked_add(added).ok_or_else(overflow)?;

        let projected_leverage = projected_gross.checked_div(equity).ok_or_else(overflow)?;
        if projected_leverage > self.config.l_max {
            return Err(RiskRejection::LeverageExceeded {
                projected: projected_leverage,
                limit: self.config.l_max,
            });
        }

        let symbol_limit = self.config.l_symbol_max.saturating_mul(equity);
        let held = match positions.get(&action.symbol) {
            Some(position) => exposure_of(position, mark).ok_or_else(overflow)?,
            None => Decimal::ZERO,
        };
        let projected_symbol = held.checked_add(added).ok_or_else(overflow)?;
        if projected_symbol > symbol_limit {
            return Err(RiskRejection::SymbolExposureExceeded {
                symbol: action.symbol.clone(),
                projected: projected_symbol,
                limit: symbol_limit,
            });
        }

        let margin = projected_gross
            .checked_mul(self.config.mmr)
            .ok_or_else(overflow)?;
        let projected_available = equity.checked_sub(margin).ok_or_else(overflow)?;
        if projected_available < Decimal::ZERO {
            return Err(RiskRejection::InsufficientMargin {
                available: projected_available,
            });
        }

        Ok(())
    }

    /// Liquidation distance for a position with filled exposure.
    ///
    /// Uses the exchange-reported liquidation price when present; otherwise
    /// estimates it from the account-wide margin buffer spread over this
    /// position's quantity.
    fn distance_for(
        &self,
        position: &Position,
        account: &AccountState,
        positions: &BTreeMap<Symbol, Position>,
        prices: &BTreeMap<Symbol, MarketQuote>,
    ) -> Option<Decimal> {
        if !position.state().has_exposure() {
            return None;
        }
        let quote = prices.get(position.symbol())?;
        let mark = quote.mark_price;
        if mark <= Decimal::ZERO {
            return None;
        }

        let liquidation = match quote.liquidation_price {
            Some(price) => price,
            None => self.estimate_liquidation_price(position, mark, account, positions, prices)?,
        };

        mark.checked_sub(liquidation)?.abs().checked_div(mark)
    }

    fn estimate_liquidation_price(
        &self,
        position: &Position,
        mark: Decimal,
        account: &AccountState,
        positions: &BTreeMap<Symbol, Position>,
        prices: &BTreeMap<Symbol, MarketQuote>,
    ) -> Option<Decimal> {
        let gross = gross_exposure(positions, prices).gross;
        let available = account
            .equity
            .saturating_sub(gross.saturating_mul(self.config.mmr));
        let buffer = available
            .max(Decimal::ZERO)
            .checked_div(position.quantity())?;

        let price = match position.direction()? {
            Direction::Long => mark.saturating_sub(buffer).max(Decimal::ZERO),
            Direction::Short => mark.saturating_add(buffer),
        };
        Some(price)
    }

    /// Compute account risk figures for monitoring
    pub fn metrics(
        &self,
        account: &AccountState,
        positions: &BTreeMap<Symbol, Position>,
        prices: &BTreeMap<Symbol, MarketQuote>,
    ) -> RiskMetrics {
        let exposure = gross_exposure(positions, prices);
        let gross = exposure.gross;
        let margin_used = gross.saturating_mul(self.config.mmr);
        let leverage = if account.equity > Decimal::ZERO {
            gross.checked_div(account.equity)
        } else {
            None
        };

        let mut metrics = RiskMetrics {
            equity: account.equity,
            gross_exposure: gross,
            leverage,
            margin_used,
            margin_available: account.equity.saturating_sub(margin_used),
            unpriced: exposure.unpriced,
            ..Default::default()
        };

        for position in positions.values() {
            if let Some(distance) = self.distance_for(position, account, positions, prices) {
                let symbol = position.symbol().clone();
                if distance < self.config.d_critical {
                    metrics.below_critical.push(symbol.clone());
                }
                if distance < self.config.d_min_safe {
                    metrics.below_min_safe.push(symbol.clone());
                }
                metrics.liquidation_distance.insert(symbol, distance);
            }
        }

        metrics
    }

    /// REDUCE suggestions that bring leverage back to `l_target`.
    ///
    /// Largest OPEN exposures are cut first; each cut removes at least
    /// `reduction_pct` of that position. Empty when leverage is already at
    /// or below target.
    pub fn suggest_deleverage(
        &self,
        account: &AccountState,
        positions: &BTreeMap<Symbol, Position>,
        prices: &BTreeMap<Symbol, MarketQuote>,
    ) -> Vec<DeleverageSuggestion> {
        if account.equity <= Decimal::ZERO {
            return Vec::new();
        }
        let gross = gross_exposure(positions, prices).gross;
        let target = self.config.l_target.saturating_mul(account.equity);
        let mut excess = gross.saturating_sub(target);
        if excess <= Decimal::ZERO {
            return Vec::new();
        }

        let mut candidates: Vec<(&Position, Decimal)> = positions
            .values()
            .filter(|p| p.state() == PositionState::Open)
            .filter_map(|p| {
                let mark = prices.get(p.symbol())?.mark_price;
                (mark > Decimal::ZERO).then_some((p, mark))
            })
            .collect();
        candidates.sort_by(|(a, pa), (b, pb)| {
            exposure_of(b, *pb)
                .cmp(&exposure_of(a, *pa))
                .then_with(|| a.symbol().cmp(b.symbol()))
        });

        let mut suggestions = Vec::new();
        for (position, mark) in candidates {
            if excess <= Decimal::ZERO {
                break;
            }
            let held = position.quantity();
            let needed = excess.checked_div(mark).unwrap_or(held);
            let quantity = needed
                .max(held.saturating_mul(self.config.reduction_pct))
                .min(held);
            let reduction = quantity.saturating_mul(mark);
            excess = excess.saturating_sub(reduction);
            suggestions.push(DeleverageSuggestion {
                symbol: position.symbol().clone(),
                quantity,
                exposure_reduction: reduction,
            });
        }
        suggestions
    }
}

/// Exposure counted for one position: filled quantity, or the requested
/// quantity while an entry is in flight. None on overflow.
fn exposure_of(position: &Position, mark: Decimal) -> Option<Decimal> {
    let quantity = match position.state() {
        PositionState::Entering => position.pending_quantity(),
        _ => position.quantity(),
    };
    quantity.checked_mul(mark).map(|e| e.abs())
}

/// Gross exposure over held and pending positions
struct Exposure {
    /// Saturates at `Decimal::MAX` when `overflow` is set
    gross: Decimal,
    /// Symbols with exposure but no mark price
    unpriced: Vec<Symbol>,
    /// First symbol whose exposure left the representable range
    overflow: Option<Symbol>,
}

fn gross_exposure(
    positions: &BTreeMap<Symbol, Position>,
    prices: &BTreeMap<Symbol, MarketQuote>,
) -> Exposure {
    let mut exposure = Exposure {
        gross: Decimal::ZERO,
        unpriced: Vec::new(),
        overflow: None,
    };
    for position in positions.values().filter(|p| !p.is_flat()) {
        let Some(quote) = prices.get(position.symbol()) else {
            exposure.unpriced.push(position.symbol().clone());
            continue;
        };
        let added = exposure_of(position, quote.mark_price);
        match added.and_then(|e| exposure.gross.checked_add(e)) {
            Some(gross) => exposure.gross = gross,
            None => {
                exposure.gross = Decimal::MAX;
                exposure.overflow.get_or_insert_with(|| position.symbol().clone());
            }
        }
    }
    exposure
}
