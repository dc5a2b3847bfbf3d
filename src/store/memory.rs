//! In-process store.
//!
//! Runs the admission routine natively under a per-key lock, with the same
//! bucket and TTL behaviour the Redis script has. Useful for single-process
//! deployments and for tests that should not need a Redis server.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Reply, Routine, Store, StoreError};
use crate::ratelimit::clock::{Clock, SystemClock};
use crate::ratelimit::engine::{self, BucketSet, ADMISSION_ROUTINE};

type Slot = Arc<Mutex<Option<BucketSet>>>;

/// A store keeping every record in memory.
///
/// Each key has its own mutex. The map's shard lock is only held long enough
/// to fetch that mutex, so unrelated keys never wait on one another while a
/// routine runs.
///
/// A slot whose record ends up absent is dropped after the routine. Records
/// that simply expire stay until [`MemoryStore::purge_expired`] runs; long
/// running processes should call it periodically or use
/// [`MemoryStore::spawn_purger`].
pub struct MemoryStore {
    records: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store that expires records against the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }

    /// Create a store that expires records against `clock`.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            records: DashMap::new(),
            clock: Arc::new(clock),
        }
    }

    fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.records.get(key) {
            return slot.clone();
        }
        self.records.entry(key.to_string()).or_default().clone()
    }

    /// Set a raw field on a key's record without touching its TTL.
    ///
    /// Creates the record without an expiry when it does not exist.
    pub fn seed(&self, key: &str, field: impl Into<String>, value: impl ToString) {
        let slot = self.slot(key);
        let mut record = slot.lock();
        let now = self.clock.now();
        if record.as_ref().is_some_and(|set| set.is_expired(now)) {
            *record = None;
        }
        record.get_or_insert_with(BucketSet::new).insert(field, value);
    }

    /// Raw fields of a live record.
    pub fn fields(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.live(key, |set| set.fields().clone())
    }

    /// Remaining TTL of a live record, in seconds. `None` when the record is
    /// missing or carries no expiry.
    pub fn ttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.live(key, |set| set.ttl(now)).flatten()
    }

    fn live<T>(&self, key: &str, f: impl FnOnce(&BucketSet) -> T) -> Option<T> {
        let slot = self.records.get(key)?.clone();
        let record = slot.lock();
        let now = self.clock.now();
        record.as_ref().filter(|set| !set.is_expired(now)).map(f)
    }

    /// Drop records that are gone or expired. Returns how many were removed.
    ///
    /// A slot that is currently handed out to a caller is left in place; it
    /// will be collected on a later pass.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            slot.lock().as_ref().is_some_and(|set| !set.is_expired(now))
        });
        before - self.records.len()
    }

    /// Purge expired records every `interval` on the tokio runtime.
    ///
    /// The task stops once the store is dropped. `interval` must be non-zero.
    pub fn spawn_purger(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, remaining = store.len(), "Purged expired records");
                }
            }
            info!("Memory store dropped, purger stopped");
        })
    }

    /// Drop the slot for `key` when its record is absent and nobody else holds it.
    fn release(&self, key: &str, slot: Slot) {
        drop(slot);
        self.records.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_some_and(|record| record.is_none())
        });
    }

    /// Number of slots currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no slots.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn eval(&self, routine: &Routine, key: &str, argv: &[String]) -> Result<Reply, StoreError> {
        if routine.name() != ADMISSION_ROUTINE.name() {
            return Err(StoreError::UnknownRoutine(routine.name().to_string()));
        }

        let slot = self.slot(key);
        let mut record = slot.lock();
        let now = self.clock.now();
        if record.as_ref().is_some_and(|set| set.is_expired(now)) {
            *record = None;
        }

        let evaluation = engine::admit(&mut record, argv, now);
        let absent = record.is_none();
        drop(record);
        if absent {
            self.release(key, slot);
        }

        debug!(
            key = %key,
            code = ?evaluation.code,
            pruned = evaluation.pruned,
            running_total = evaluation.running_total,
            "Ran admission routine in memory"
        );

        Ok(Reply::Integer(evaluation.code.as_i64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::engine::AdmissionArgs;
    use crate::ratelimit::window::truncate;
    use std::time::Duration;

    const NOW: i64 = 1_664_832_874;

    fn argv(now: i64, threshold: i64) -> Vec<String> {
        AdmissionArgs {
            now,
            start_of_window: truncate(now - 60, 60),
            end_of_window: truncate(now, 60),
            precision_secs: 60,
            stale_age_secs: 3600,
            threshold,
        }
        .to_argv()
    }

    #[tokio::test]
    async fn test_eval_creates_record_with_ttl() {
        let store = MemoryStore::with_clock(ManualClock::new(NOW));

        let reply = store.eval(&ADMISSION_ROUTINE, "foo", &argv(NOW, 2)).await.unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert_eq!(store.fields("foo").unwrap().len(), 1);
        assert_eq!(store.ttl("foo"), Some(120));
    }

    #[tokio::test]
    async fn test_unknown_routine_is_rejected() {
        let store = MemoryStore::new();
        let other = Routine::new("other", "return 1");

        let err = store.eval(&other, "foo", &argv(NOW, 2)).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownRoutine(name) if name == "other"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_records_expire_with_store_clock() {
        let clock = ManualClock::new(NOW);
        let store = MemoryStore::with_clock(clock.clone());

        for expected in [1, 1, 0] {
            let reply = store.eval(&ADMISSION_ROUTINE, "foo", &argv(NOW, 2)).await.unwrap();
            assert_eq!(reply, Reply::Integer(expected));
        }

        clock.advance(Duration::from_secs(120));
        assert!(store.fields("foo").is_none());
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());

        let reply = store.eval(&ADMISSION_ROUTINE, "foo", &argv(NOW, 2)).await.unwrap();
        assert_eq!(reply, Reply::Integer(1));
    }

    #[tokio::test]
    async fn test_rejected_call_leaves_no_slot() {
        let store = MemoryStore::with_clock(ManualClock::new(NOW));

        let reply = store.eval(&ADMISSION_ROUTINE, "foo", &argv(NOW, 0)).await.unwrap();
        assert_eq!(reply, Reply::Integer(-2));
        assert!(store.is_empty());

        let bad = vec!["now".to_string(); 6];
        let reply = store.eval(&ADMISSION_ROUTINE, "bar", &bad).await.unwrap();
        assert_eq!(reply, Reply::Integer(-3));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_call_keeps_live_record() {
        let store = MemoryStore::with_clock(ManualClock::new(NOW));

        store.eval(&ADMISSION_ROUTINE, "foo", &argv(NOW, 2)).await.unwrap();
        store.eval(&ADMISSION_ROUTINE, "foo", &argv(NOW, 0)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.fields("foo").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purger_reclaims_expired_slots() {
        let clock = ManualClock::new(NOW);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        for key in ["a", "b", "c"] {
            store.eval(&ADMISSION_ROUTINE, key, &argv(NOW, 2)).await.unwrap();
        }
        assert_eq!(store.len(), 3);

        let purger = store.spawn_purger(Duration::from_millis(10));
        clock.advance(Duration::from_secs(120));

        for _ in 0..100 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.is_empty());

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), purger)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_seeded_record_without_ttl_is_repaired() {
        let store = MemoryStore::with_clock(ManualClock::new(NOW));
        store.seed("foo", "garbage", 1);
        assert_eq!(store.ttl("foo"), None);

        store.eval(&ADMISSION_ROUTINE, "foo", &argv(NOW, 2)).await.unwrap();
        let fields = store.fields("foo").unwrap();
        assert_eq!(fields.len(), 1);
        assert!(!fields.contains_key("garbage"));
        assert_eq!(store.ttl("foo"), Some(120));

        store.seed("foo", "1664832840:900", 3);
        assert_eq!(store.ttl("foo"), Some(120));
        assert_eq!(store.fields("foo").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryStore::with_clock(ManualClock::new(NOW));

        store.eval(&ADMISSION_ROUTINE, "a", &argv(NOW, 1)).await.unwrap();
        let reply = store.eval(&ADMISSION_ROUTINE, "b", &argv(NOW, 1)).await.unwrap();
        assert_eq!(reply, Reply::Integer(1));

        let reply = store.eval(&ADMISSION_ROUTINE, "a", &argv(NOW, 1)).await.unwrap();
        assert_eq!(reply, Reply::Integer(0));
        assert_eq!(store.len(), 2);
    }
}
