//! Arbitrator - 指令仲裁
//!
//! Resolves the mandates for one symbol into exactly one [`Action`].
//!
//! # Rules
//!
//! 1. Mandates for other symbols, inactive mandates and kinds the current
//!    position state does not admit are dropped.
//! 2. Any admissible EXIT wins outright, before anything is ranked.
//! 3. A BLOCK removes every ENTRY. BLOCK itself is never the result.
//! 4. The highest kind rank wins (REDUCE > ENTRY > HOLD).
//! 5. Within that rank: higher authority, then lowest source id, then earliest
//!    timestamp, then lowest mandate id.
//! 6. Nothing left resolves to NoAction.
//!
//! Everything here is a pure function of its arguments.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::domain::{Action, Mandate, MandateKind, Position, PositionState, Symbol};

/// Resolve the single action for `symbol` in `state`
pub fn arbitrate(symbol: &Symbol, state: PositionState, mandates: &[Mandate]) -> Action {
    let admissible: Vec<&Mandate> = mandates
        .iter()
        .filter(|m| &m.symbol == symbol && m.is_active() && state.admits(m.kind))
        .collect();

    if let Some(exit) = admissible
        .iter()
        .filter(|m| m.kind == MandateKind::Exit)
        .min_by(|a, b| precedence(a, b))
    {
        return Action::from_mandate(exit);
    }

    let blocked = admissible.iter().any(|m| m.kind == MandateKind::Block);

    admissible
        .iter()
        .filter(|m| m.kind != MandateKind::Block)
        .filter(|m| !(blocked && m.kind == MandateKind::Entry))
        .min_by(|a, b| {
            b.kind
                .rank()
                .cmp(&a.kind.rank())
                .then_with(|| precedence(a, b))
        })
        .map(|m| Action::from_mandate(m))
        .unwrap_or_else(|| Action::no_action(symbol.clone()))
}

/// Arbitrate every symbol that has at least one mandate.
///
/// Symbols missing from `positions` are treated as FLAT.
pub fn arbitrate_all(
    positions: &BTreeMap<Symbol, Position>,
    mandates: &[Mandate],
) -> BTreeMap<Symbol, Action> {
    let mut by_symbol: BTreeMap<&Symbol, Vec<Mandate>> = BTreeMap::new();
    for mandate in mandates {
        by_symbol
            .entry(&mandate.symbol)
            .or_default()
            .push(mandate.clone());
    }

    by_symbol
        .into_iter()
        .map(|(symbol, group)| {
            let state = positions
                .get(symbol)
                .map(|p| p.state())
                .unwrap_or(PositionState::Flat);
            (symbol.clone(), arbitrate(symbol, state, &group))
        })
        .collect()
}

/// Within-rank ordering; `Less` means `a` wins
fn precedence(a: &Mandate, b: &Mandate) -> Ordering {
    b.authority
        .cmp(&a.authority)
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionKind, Direction};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::from("BTC")
    }

    #[test]
    fn test_exit_beats_higher_authority_reduce() {
        let reduce = Mandate::new("BTC", MandateKind::Reduce, "a")
            .with_authority(3)
            .with_quantity(dec!(1));
        let exit = Mandate::new("BTC", MandateKind::Exit, "b").with_authority(1);
        let action = arbitrate(&btc(), PositionState::Open, &[reduce, exit.clone()]);
        assert_eq!(action.kind, ActionKind::Exit);
        assert_eq!(action.originating_mandate_id, Some(exit.id));
    }

    #[test]
    fn test_block_filters_entry() {
        let block = Mandate::new("BTC", MandateKind::Block, "guard");
        let entry = Mandate::entry("BTC", "trend", Direction::Long, dec!(1)).with_authority(99);
        let action = arbitrate(&btc(), PositionState::Flat, &[block, entry]);
        assert_eq!(action.kind, ActionKind::NoAction);
    }

    #[test]
    fn test_block_with_hold_resolves_to_hold() {
        let block = Mandate::new("BTC", MandateKind::Block, "guard");
        let hold = Mandate::new("BTC", MandateKind::Hold, "mm");
        let action = arbitrate(&btc(), PositionState::Open, &[block, hold]);
        assert_eq!(action.kind, ActionKind::Hold);
    }

    #[test]
    fn test_inadmissible_kinds_are_dropped() {
        let exit = Mandate::new("BTC", MandateKind::Exit, "a");
        let reduce = Mandate::new("BTC", MandateKind::Reduce, "a").with_quantity(dec!(1));
        let action = arbitrate(&btc(), PositionState::Flat, &[exit, reduce]);
        assert_eq!(action.kind, ActionKind::NoAction);

        let entry = Mandate::entry("BTC", "a", Direction::Long, dec!(1));
        let action = arbitrate(&btc(), PositionState::Entering, &[entry]);
        assert_eq!(action.kind, ActionKind::NoAction);
    }

    #[test]
    fn test_other_symbols_and_inactive_are_ignored() {
        let mut consumed = Mandate::new("BTC", MandateKind::Exit, "a");
        consumed.status = crate::domain::MandateStatus::Consumed;
        let eth_exit = Mandate::new("ETH", MandateKind::Exit, "a");
        let action = arbitrate(&btc(), PositionState::Open, &[consumed, eth_exit]);
        assert_eq!(action.kind, ActionKind::NoAction);
    }

    #[test]
    fn test_tie_break_order() {
        let now = Utc::now();
        let late_a = Mandate::entry("BTC", "a", Direction::Long, dec!(1)).at(now);
        let early_b = Mandate::entry("BTC", "b", Direction::Long, dec!(1))
            .at(now - Duration::seconds(5));
        let action = arbitrate(&btc(), PositionState::Flat, &[early_b.clone(), late_a.clone()]);
        assert_eq!(action.originating_mandate_id, Some(late_a.id));

        let early_a = Mandate::entry("BTC", "a", Direction::Short, dec!(1))
            .at(now - Duration::seconds(1));
        let action = arbitrate(&btc(), PositionState::Flat, &[late_a.clone(), early_a.clone()]);
        assert_eq!(action.originating_mandate_id, Some(early_a.id));

        let senior = Mandate::entry("BTC", "z", Direction::Long, dec!(1)).with_authority(7);
        let action = arbitrate(&btc(), PositionState::Flat, &[late_a, early_a, senior.clone()]);
        assert_eq!(action.originating_mandate_id, Some(senior.id));
    }

    #[test]
    fn test_arbitrate_all_one_action_per_symbol() {
        let mandates = vec![
            Mandate::entry("BTC", "a", Direction::Long, dec!(1)),
            Mandate::entry("BTC", "b", Direction::Short, dec!(1)),
            Mandate::new("ETH", MandateKind::Hold, "a"),
        ];
        let actions = arbitrate_all(&BTreeMap::new(), &mandates);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[&btc()].kind, ActionKind::Entry);
        assert_eq!(actions[&Symbol::from("ETH")].kind, ActionKind::Hold);
    }
}
