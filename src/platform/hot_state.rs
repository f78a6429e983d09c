//! Hot State Store - 熱狀態快照
//!
//! Single-writer, many-reader publication of [`HotStateSnapshot`] values.
//!
//! # How it works
//!
//! Two slots hold the two most recent snapshots and a version counter names
//! the current one (`slot = version % 2`). The writer installs the next
//! snapshot in the inactive slot and only then advances the version. A
//! reader loads the version, clones the `Arc` out of the matching slot and
//! loads the version again; if it moved, or the slot already holds a newer
//! snapshot, the read is retried. Replaced slot values are reclaimed through
//! `crossbeam-epoch`, so a reader never dereferences freed memory, and a
//! published snapshot is never written again.

use chrono::Utc;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::HotStateSnapshot;
use crate::error::{ArbiterError, Result};

struct Inner {
    slots: [Atomic<Arc<HotStateSnapshot>>; 2],
    version: AtomicU64,
    reads: AtomicU64,
    retries: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // SAFETY: `drop` has exclusive access, so no reader holds a guard on
        // either slot and no other thread can observe the pointers.
        unsafe {
            let guard = epoch::unprotected();
            for slot in &self.slots {
                let shared = slot.load(Ordering::Relaxed, guard);
                if !shared.is_null() {
                    drop(shared.into_owned());
                }
            }
        }
    }
}

/// Read/retry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotStateStats {
    pub version: u64,
    pub reads: u64,
    pub retries: u64,
}

/// Constructor for the writer/reader pair
pub struct HotStateStore;

impl HotStateStore {
    /// Create a store whose first visible snapshot is `genesis` at version 0
    pub fn new(mut genesis: HotStateSnapshot) -> (HotStateWriter, HotStateReader) {
        genesis.version = 0;
        let inner = Arc::new(Inner {
            slots: [Atomic::new(Arc::new(genesis)), Atomic::null()],
            version: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        });
        (
            HotStateWriter {
                inner: Arc::clone(&inner),
            },
            HotStateReader { inner },
        )
    }
}

/// The single publisher. Not `Clone`; `publish` takes `&mut self`.
pub struct HotStateWriter {
    inner: Arc<Inner>,
}

impl HotStateWriter {
    /// Publish `snapshot` as the next version and return that version
    pub fn publish(&mut self, mut snapshot: HotStateSnapshot) -> u64 {
        let next = self.inner.version.load(Ordering::Relaxed) + 1;
        snapshot.version = next;

        let guard = epoch::pin();
        let slot = &self.inner.slots[(next % 2) as usize];
        let old = slot.swap(Owned::new(Arc::new(snapshot)), Ordering::AcqRel, &guard);
        self.inner.version.store(next, Ordering::Release);

        if !old.is_null() {
            // SAFETY: `old` is unreachable from the slots after the swap; readers
            // still holding it are pinned and keep it alive until they unpin.
            unsafe { guard.defer_destroy(old) };
        }
        next
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn reader(&self) -> HotStateReader {
        HotStateReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Cheap, cloneable read handle
#[derive(Clone)]
pub struct HotStateReader {
    inner: Arc<Inner>,
}

impl HotStateReader {
    /// Current `(version, snapshot)`; never blocks on the writer
    pub fn read(&self) -> (u64, Arc<HotStateSnapshot>) {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        loop {
            let guard = epoch::pin();
            let version = self.inner.version.load(Ordering::Acquire);
            let shared = self.inner.slots[(version % 2) as usize].load(Ordering::Acquire, &guard);

            // SAFETY: slot values are only destroyed via `defer_destroy`, and
            // `guard` pins the current epoch for the lifetime of `shared`.
            if let Some(current) = unsafe { shared.as_ref() } {
                let snapshot = Arc::clone(current);
                if snapshot.version == version
                    && self.inner.version.load(Ordering::Acquire) == version
                {
                    return (version, snapshot);
                }
            }

            self.inner.retries.fetch_add(1, Ordering::Relaxed);
            std::hint::spin_loop();
        }
    }

    /// Like [`read`](Self::read), refusing snapshots older than `max_age_ms`
    pub fn read_fresh(&self, max_age_ms: u64) -> Result<(u64, Arc<HotStateSnapshot>)> {
        let (version, snapshot) = self.read();
        let age_ms = snapshot.age_ms(Utc::now());
        if age_ms > max_age_ms {
            return Err(ArbiterError::StaleSnapshot {
                version,
                age_ms,
                max_age_ms,
            });
        }
        Ok((version, snapshot))
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HotStateStats {
        HotStateStats {
            version: self.version(),
            reads: self.inner.reads.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for HotStateReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotStateReader")
            .field("stats", &self.stats())
            .finish()
    }
}

impl std::fmt::Debug for HotStateWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotStateWriter")
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountState, MarketQuote};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_genesis_is_version_zero() {
        let (_writer, reader) = HotStateStore::new(HotStateSnapshot::new(AccountState::new(dec!(5))));
        let (version, snapshot) = reader.read();
        assert_eq!(version, 0);
        assert_eq!(snapshot.account.equity, dec!(5));
    }

    #[test]
    fn test_publish_advances_version() {
        let (mut writer, reader) = HotStateStore::new(HotStateSnapshot::default());
        for i in 1..=5u64 {
            let snapshot = HotStateSnapshot::new(AccountState::new(i.into()))
                .with_quote("BTC", MarketQuote::new(dec!(100)));
            assert_eq!(writer.publish(snapshot), i);
        }
        let (version, snapshot) = reader.read();
        assert_eq!(version, 5);
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.account.equity, dec!(5));
    }

    #[test]
    fn test_old_snapshot_survives_replacement() {
        let (mut writer, reader) = HotStateStore::new(HotStateSnapshot::default());
        writer.publish(HotStateSnapshot::new(AccountState::new(dec!(1))));
        let (_, held) = reader.read();
        writer.publish(HotStateSnapshot::new(AccountState::new(dec!(2))));
        writer.publish(HotStateSnapshot::new(AccountState::new(dec!(3))));
        assert_eq!(held.account.equity, dec!(1));
        assert_eq!(reader.read().1.account.equity, dec!(3));
    }

    #[test]
    fn test_read_fresh_rejects_stale() {
        let (mut writer, reader) = HotStateStore::new(HotStateSnapshot::default());
        let mut old = HotStateSnapshot::new(AccountState::new(dec!(1)));
        old.published_at = Utc::now() - Duration::seconds(10);
        writer.publish(old);

        match reader.read_fresh(1_000) {
            Err(ArbiterError::StaleSnapshot { version, .. }) => assert_eq!(version, 1),
            other => panic!("expected stale snapshot, got {:?}", other.map(|(v, _)| v)),
        }

        writer.publish(HotStateSnapshot::new(AccountState::new(dec!(1))));
        assert!(reader.read_fresh(1_000).is_ok());
    }
}
