//! Shared state stores for circuit records
//!
//! This module provides the store contract and its in-process implementation:
//! - `StateStore`: read, unconditional write, and compare-and-swap with
//!   optional TTL
//! - `MemoryStore`: thread-safe map for breakers living in a single process
//!
//! A networked implementation over Redis lives in `redis_store` behind the
//! `redis` feature.

use crate::clock::{Clock, SystemClock};
use crate::errors::StoreError;
use crate::record::{CircuitRecord, Version, Versioned};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the record now carries this version
    Swapped(Version),
    /// Someone else wrote first; re-read and decide again
    Conflict,
}

/// Atomic key-value store shared by every caller of a breaker key
///
/// This is the only coordination point between processes. Implementations
/// must make `compare_and_swap` atomic with respect to every other write on
/// the same key.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Read the current record, `None` when the key was never written or has
    /// expired
    async fn read(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Unconditional overwrite, used for initialization and operator resets
    async fn write(&self, key: &str, record: &CircuitRecord) -> Result<Version, StoreError>;

    /// Unconditional overwrite that disappears after `ttl`
    async fn write_with_ttl(
        &self,
        key: &str,
        record: &CircuitRecord,
        ttl: Duration,
    ) -> Result<Version, StoreError>;

    /// Write `record` only if the stored version is `expected`
    ///
    /// `expected = None` means the key must currently be absent. A `ttl`
    /// makes the new record expire; without one any previous expiry is
    /// cleared.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Version>,
        record: &CircuitRecord,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    record: CircuitRecord,
    version: Version,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<String, Entry>,
    /// Never reused, so a version read before an expiry cannot match the
    /// record written after it
    last_version: u64,
}

impl Entries {
    fn live(&mut self, key: &str, now: u64) -> Option<&Entry> {
        let expired = self
            .by_key
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| now >= at));
        if expired {
            self.by_key.remove(key);
        }
        self.by_key.get(key)
    }

    fn put(&mut self, key: &str, record: &CircuitRecord, expires_at: Option<u64>) -> Version {
        self.last_version += 1;
        let version = Version::new(self.last_version);
        self.by_key.insert(
            key.to_string(),
            Entry {
                record: record.clone(),
                version,
                expires_at,
            },
        );
        version
    }
}

/// Thread-safe in-memory store for breakers sharing one process
///
/// TTLs are measured with the store's clock so tests driving a
/// `ManualClock` see records expire deterministically.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a new store backed by the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that measures TTLs with the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();
        entries
            .by_key
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| now < at))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|ttl| self.clock.now_millis().saturating_add(ttl.as_millis() as u64))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        Ok(entries.live(key, now).map(|e| Versioned {
            record: e.record.clone(),
            version: e.version,
        }))
    }

    async fn write(&self, key: &str, record: &CircuitRecord) -> Result<Version, StoreError> {
        Ok(self.entries.lock().put(key, record, None))
    }

    async fn write_with_ttl(
        &self,
        key: &str,
        record: &CircuitRecord,
        ttl: Duration,
    ) -> Result<Version, StoreError> {
        let expires_at = self.expiry(Some(ttl));
        Ok(self.entries.lock().put(key, record, expires_at))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Version>,
        record: &CircuitRecord,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock();

        let current = entries.live(key, now).map(|e| e.version);
        if current != expected {
            return Ok(CasOutcome::Conflict);
        }

        Ok(CasOutcome::Swapped(entries.put(key, record, expires_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::CircuitState;

    #[tokio::test]
    async fn test_memory_store_read_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.read("payments").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_create_requires_absent_key() {
        let store = MemoryStore::new();
        let record = CircuitRecord::closed(0);

        let first = store
            .compare_and_swap("payments", None, &record, None)
            .await
            .unwrap();
        assert!(matches!(first, CasOutcome::Swapped(_)));

        let second = store
            .compare_and_swap("payments", None, &record, None)
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_memory_store_cas_same_version_only_one_wins() {
        let store = MemoryStore::new();
        let version = store.write("db", &CircuitRecord::closed(0)).await.unwrap();

        let opened = CircuitRecord::closed(0).opened(10, Duration::from_secs(5));
        let a = store
            .compare_and_swap("db", Some(version), &opened, None)
            .await
            .unwrap();
        let b = store
            .compare_and_swap("db", Some(version), &opened, None)
            .await
            .unwrap();

        assert!(matches!(a, CasOutcome::Swapped(_)));
        assert_eq!(b, CasOutcome::Conflict);

        let current = store.read("db").await.unwrap().unwrap();
        assert_eq!(current.record.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_memory_store_versions_increase() {
        let store = MemoryStore::new();
        let v1 = store.write("a", &CircuitRecord::closed(0)).await.unwrap();
        let v2 = store.write("a", &CircuitRecord::closed(1)).await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn test_memory_store_ttl_expires_into_absence() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());

        store
            .write_with_ttl("a", &CircuitRecord::closed(0), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(store.read("a").await.unwrap().is_some());
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_millis(100));
        assert_eq!(store.read("a").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_stale_version_after_expiry_conflicts() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());

        let old = store
            .write_with_ttl("a", &CircuitRecord::closed(0), Duration::from_millis(10))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(20));
        store.write("a", &CircuitRecord::closed(20)).await.unwrap();

        let outcome = store
            .compare_and_swap("a", Some(old), &CircuitRecord::closed(30), None)
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_memory_store_cas_without_ttl_clears_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());

        let v = store
            .write_with_ttl("a", &CircuitRecord::closed(0), Duration::from_millis(10))
            .await
            .unwrap();
        store
            .compare_and_swap("a", Some(v), &CircuitRecord::closed(1), None)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));
        assert!(store.read("a").await.unwrap().is_some());
    }
}
