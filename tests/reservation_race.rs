//! Concurrent reservation attempts on the same symbol

use arbiter::domain::Symbol;
use arbiter::platform::{ReleaseOutcome, ReservationManager};
use std::sync::Barrier;

#[test]
fn test_two_simultaneous_reservations_one_wins() {
    let manager = ReservationManager::new();

    for round in 0..200 {
        let symbol = Symbol::from(format!("SYM{}", round));
        let barrier = Barrier::new(2);

        let (a, b) = std::thread::scope(|s| {
            let first = s.spawn(|| {
                barrier.wait();
                manager.try_reserve(&symbol, "worker-a")
            });
            let second = s.spawn(|| {
                barrier.wait();
                manager.try_reserve(&symbol, "worker-b")
            });
            (first.join().unwrap(), second.join().unwrap())
        });

        let (token, conflict) = match (a, b) {
            (Ok(token), Err(conflict)) | (Err(conflict), Ok(token)) => (token, conflict),
            (Ok(_), Ok(_)) => panic!("round {}: both reservations succeeded", round),
            (Err(_), Err(_)) => panic!("round {}: both reservations failed", round),
        };
        assert_eq!(conflict.symbol, symbol);
        // The loser may observe the slot before the winner's receipt lands
        if let Some(holder) = conflict.holder {
            assert_eq!(holder.holder_id, token.holder_id());
        }

        // Released symbol is immediately available again
        assert_eq!(manager.release(token), ReleaseOutcome::Released);
        let third = manager.try_reserve(&symbol, "worker-c").unwrap();
        assert_eq!(third.holder_id(), "worker-c");
        manager.release(third);
    }
    assert_eq!(manager.held_count(), 0);
}

#[test]
fn test_many_contenders_single_holder() {
    let manager = ReservationManager::new();
    let symbol = Symbol::from("BTC");
    let contenders = 8;
    let barrier = Barrier::new(contenders);

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let (manager, symbol, barrier) = (&manager, &symbol, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    manager.try_reserve(symbol, &format!("worker-{}", i))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = results.into_iter().filter_map(|r| r.ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(manager.held_count(), 1);
    assert_eq!(
        manager.holder(&symbol).map(|h| h.holder_id),
        Some(winners[0].holder_id().to_string())
    );
}
