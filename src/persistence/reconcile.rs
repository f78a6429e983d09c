//! Startup reconciliation
//!
//! Persisted positions may be stale or missing after a crash. Before the
//! pipeline starts, each symbol's persisted position is compared with what the
//! venue reports; the venue wins every disagreement. Orders that were in
//! flight when the previous process died are treated as dead: pending states
//! settle to whatever the venue holds now.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use super::store::PositionStore;
use crate::domain::{Position, PositionState, Symbol};
use crate::error::Result;
use crate::exchange::{ExecutionVenue, VenuePosition};
use crate::platform::PositionBook;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Positions loaded into the book
    pub restored: usize,
    /// Symbols whose persisted position was replaced by venue truth
    pub corrected: Vec<Symbol>,
}

/// Rebuild `book` from `store`, corrected against `venue`
pub async fn reconcile(
    store: &dyn PositionStore,
    venue: &dyn ExecutionVenue,
    book: &PositionBook,
) -> Result<ReconcileReport> {
    let persisted: BTreeMap<Symbol, Position> = store
        .load_all()
        .await?
        .into_iter()
        .map(|p| (p.symbol().clone(), p))
        .collect();
    let live: BTreeMap<Symbol, VenuePosition> = venue
        .open_positions()
        .await?
        .into_iter()
        .filter(|p| !p.quantity.is_zero())
        .map(|p| (p.symbol.clone(), p))
        .collect();

    let symbols: BTreeSet<&Symbol> = persisted.keys().chain(live.keys()).collect();
    let mut report = ReconcileReport::default();
    let mut restored = Vec::with_capacity(symbols.len());

    for symbol in symbols {
        let stored = persisted.get(symbol);
        let resolved = match live.get(symbol) {
            Some(venue_position) => match stored {
                Some(p) if matches_venue(p, venue_position) => p.clone(),
                _ => Position::open(
                    symbol.clone(),
                    venue_position.direction,
                    venue_position.quantity,
                    venue_position.entry_price,
                )?,
            },
            None => match stored {
                Some(p) if p.is_flat() => p.clone(),
                _ => Position::flat(symbol.clone()),
            },
        };

        let changed = stored.map_or(!resolved.is_flat(), |p| {
            p.state() != resolved.state()
                || p.quantity() != resolved.quantity()
                || p.direction() != resolved.direction()
        });
        if changed {
            warn!(
                %symbol,
                persisted = ?stored.map(|p| (p.state(), p.quantity())),
                venue = ?live.get(symbol).map(|p| (p.direction, p.quantity)),
                "position disagrees with venue, venue wins"
            );
            store.save(&resolved).await?;
            report.corrected.push(symbol.clone());
        }
        restored.push(resolved);
    }

    report.restored = book.restore(restored)?;
    info!(
        restored = report.restored,
        corrected = report.corrected.len(),
        venue = venue.name(),
        "position book reconciled"
    );
    Ok(report)
}

fn matches_venue(position: &Position, venue: &VenuePosition) -> bool {
    position.state() == PositionState::Open
        && position.direction() == Some(venue.direction)
        && position.quantity() == venue.quantity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, PositionEvent};
    use crate::exchange::PaperVenue;
    use crate::persistence::MemoryStore;
    use rust_decimal_macros::dec;

    fn venue_position(symbol: &str, qty: rust_decimal::Decimal) -> VenuePosition {
        VenuePosition {
            symbol: Symbol::from(symbol),
            direction: Direction::Long,
            quantity: qty,
            entry_price: dec!(100),
        }
    }

    #[tokio::test]
    async fn test_empty_store_adopts_venue_positions() {
        let store = MemoryStore::new();
        let (venue, _rx) = PaperVenue::new(1);
        let venue = venue.with_positions(vec![venue_position("BTC", dec!(2))]);
        let book = PositionBook::new();

        let report = reconcile(&store, &venue, &book).await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.corrected, vec![Symbol::from("BTC")]);
        assert_eq!(book.state_of(&Symbol::from("BTC")), PositionState::Open);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_pending_states_settle_to_venue() {
        let store = MemoryStore::new();
        let entering = Position::flat(Symbol::from("ETH"))
            .apply(&PositionEvent::EntryAdmitted {
                direction: Direction::Long,
                quantity: dec!(1),
            })
            .unwrap();
        store.save(&entering).await.unwrap();
        let open = Position::open(Symbol::from("SOL"), Direction::Long, dec!(5), dec!(20)).unwrap();
        store.save(&open).await.unwrap();

        let (venue, _rx) = PaperVenue::new(1);
        let venue = venue.with_positions(vec![venue_position("SOL", dec!(5))]);
        let book = PositionBook::new();

        let report = reconcile(&store, &venue, &book).await.unwrap();
        assert_eq!(report.corrected, vec![Symbol::from("ETH")]);
        assert!(book.get(&Symbol::from("ETH")).unwrap().is_flat());
        assert_eq!(book.get(&Symbol::from("SOL")).unwrap().quantity(), dec!(5));
    }
}
