use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Direction, Mandate, MandateId, MandateKind, Symbol};

/// Kind of resolved decision for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Exit,
    Reduce,
    Entry,
    Hold,
    NoAction,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Exit => "EXIT",
            ActionKind::Reduce => "REDUCE",
            ActionKind::Entry => "ENTRY",
            ActionKind::Hold => "HOLD",
            ActionKind::NoAction => "NO_ACTION",
        }
    }

    /// Whether this action sends an order to the execution venue
    pub fn is_executable(&self) -> bool {
        matches!(self, ActionKind::Exit | ActionKind::Reduce | ActionKind::Entry)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who decided the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOrigin {
    /// Selected by arbitration over strategy mandates
    Arbitrated,
    /// Imposed by the risk gate (liquidation distance below critical)
    ForcedByRisk,
}

impl ActionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOrigin::Arbitrated => "arbitrated",
            ActionOrigin::ForcedByRisk => "forced_by_risk",
        }
    }
}

/// The single resolved decision for one symbol in one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub symbol: Symbol,
    pub originating_mandate_id: Option<MandateId>,
    pub direction: Option<Direction>,
    pub quantity: Decimal,
    pub origin: ActionOrigin,
}

impl Action {
    pub fn no_action(symbol: Symbol) -> Self {
        Self {
            kind: ActionKind::NoAction,
            symbol,
            originating_mandate_id: None,
            direction: None,
            quantity: Decimal::ZERO,
            origin: ActionOrigin::Arbitrated,
        }
    }

    /// Action carrying a winning mandate's intent.
    ///
    /// BLOCK never resolves to an action of its own; callers filter it out
    /// before reaching here, and it maps to NoAction as a fallback.
    pub fn from_mandate(mandate: &Mandate) -> Self {
        let kind = match mandate.kind {
            MandateKind::Exit => ActionKind::Exit,
            MandateKind::Reduce => ActionKind::Reduce,
            MandateKind::Entry => ActionKind::Entry,
            MandateKind::Hold => ActionKind::Hold,
            MandateKind::Block => return Self::no_action(mandate.symbol.clone()),
        };
        Self {
            kind,
            symbol: mandate.symbol.clone(),
            originating_mandate_id: Some(mandate.id),
            direction: mandate.direction,
            quantity: mandate.quantity,
            origin: ActionOrigin::Arbitrated,
        }
    }

    /// EXIT imposed by the risk gate
    pub fn forced_exit(symbol: Symbol) -> Self {
        Self {
            kind: ActionKind::Exit,
            symbol,
            originating_mandate_id: None,
            direction: None,
            quantity: Decimal::ZERO,
            origin: ActionOrigin::ForcedByRisk,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.origin == ActionOrigin::ForcedByRisk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_from_mandate_copies_intent() {
        let m = Mandate::entry("ETH", "s1", Direction::Short, dec!(2));
        let action = Action::from_mandate(&m);
        assert_eq!(action.kind, ActionKind::Entry);
        assert_eq!(action.originating_mandate_id, Some(m.id));
        assert_eq!(action.direction, Some(Direction::Short));
        assert_eq!(action.quantity, dec!(2));
        assert!(!action.is_forced());
    }

    #[test]
    fn test_block_never_becomes_action() {
        let m = Mandate::new("ETH", MandateKind::Block, "s1");
        assert_eq!(Action::from_mandate(&m).kind, ActionKind::NoAction);
    }

    #[test]
    fn test_forced_exit_is_distinguishable() {
        let action = Action::forced_exit(Symbol::from("ETH"));
        assert_eq!(action.kind, ActionKind::Exit);
        assert!(action.is_forced());
        assert_eq!(action.origin.as_str(), "forced_by_risk");
    }
}
