//! Readers racing a publishing writer never observe a torn snapshot

use arbiter::domain::{AccountState, HotStateSnapshot, MarketQuote, Symbol};
use arbiter::platform::HotStateStore;
use rust_decimal::Decimal;

const PUBLISHES: u64 = 20_000;

/// Every field is derived from `n`, so a mix of two publishes is detectable
fn snapshot_for(n: u64) -> HotStateSnapshot {
    let n = Decimal::from(n);
    HotStateSnapshot::new(AccountState::new(n))
        .with_quote("A", MarketQuote::new(n * Decimal::TWO))
        .with_quote("B", MarketQuote::new(n * Decimal::from(3)))
}

#[test]
fn test_readers_see_consistent_snapshots() {
    let (mut writer, reader) = HotStateStore::new(snapshot_for(0));
    let (a, b) = (Symbol::from("A"), Symbol::from("B"));

    std::thread::scope(|s| {
        for _ in 0..4 {
            let reader = reader.clone();
            let (a, b) = (&a, &b);
            s.spawn(move || {
                let mut last = 0;
                loop {
                    let (version, snapshot) = reader.read();
                    assert_eq!(snapshot.version, version);
                    assert!(version >= last, "version went backwards: {} -> {}", last, version);
                    last = version;

                    let n = Decimal::from(version);
                    assert_eq!(snapshot.account.equity, n);
                    assert_eq!(snapshot.quote(a).unwrap().mark_price, n * Decimal::TWO);
                    assert_eq!(snapshot.quote(b).unwrap().mark_price, n * Decimal::from(3));

                    if version == PUBLISHES {
                        break;
                    }
                }
            });
        }

        s.spawn(move || {
            for n in 1..=PUBLISHES {
                assert_eq!(writer.publish(snapshot_for(n)), n);
            }
        });
    });

    let stats = reader.stats();
    assert_eq!(reader.version(), PUBLISHES);
    assert!(stats.reads > 0);
}

#[test]
fn test_read_fresh_rejects_old_genesis() {
    let mut genesis = snapshot_for(0);
    genesis.published_at = chrono::Utc::now() - chrono::Duration::seconds(10);
    let (mut writer, reader) = HotStateStore::new(genesis);

    assert!(reader.read_fresh(1_000).is_err());

    writer.publish(snapshot_for(1));
    let (version, snapshot) = reader.read_fresh(1_000).unwrap();
    assert_eq!(version, 1);
    assert_eq!(snapshot.account.equity, Decimal::ONE);
}
