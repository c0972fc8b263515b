use crate::clock::Clock;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Errors reported by a store backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("key {0} does not exist")]
    MissingKey(String),
}

/// A value read from the store with its write version
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A decoded record together with the store version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// One write inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    /// Refresh the TTL of an existing key without rewriting it
    Touch { key: String },
}

/// Multi-key write applied atomically.
///
/// Every assertion must hold (`None` means the key must be absent) or the
/// whole batch is rejected with [`StoreError::VersionConflict`]. Every put and
/// touch in the batch gets the same TTL.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    assertions: Vec<(String, Option<u64>)>,
    writes: Vec<BatchWrite>,
    ttl: Option<Duration>,
}

impl WriteBatch {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            assertions: Vec::new(),
            writes: Vec::new(),
            ttl,
        }
    }

    pub fn expect_version(mut self, key: impl Into<String>, version: Option<u64>) -> Self {
        self.assertions.push((key.into(), version));
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.writes.push(BatchWrite::Put {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.writes.push(BatchWrite::Delete { key: key.into() });
        self
    }

    pub fn touch(mut self, key: impl Into<String>) -> Self {
        self.writes.push(BatchWrite::Touch { key: key.into() });
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn assertions(&self) -> &[(String, Option<u64>)] {
        &self.assertions
    }

    pub fn writes(&self) -> &[BatchWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Namespaced key-value store with TTL and versioned writes.
///
/// A key whose TTL has elapsed reads as absent; that absence is the only
/// expiry signal the engine relies on. Reads never refresh TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<u64, StoreError>;

    async fn get(&self, key: &str) -> std::result::Result<Option<StoredValue>, StoreError>;

    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError>;

    /// Write `value` only if the key's current version equals `expected`
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<u64, StoreError>;

    /// Apply a batch atomically, returning the new version of every put or touched key
    async fn commit(
        &self,
        batch: WriteBatch,
    ) -> std::result::Result<HashMap<String, u64>, StoreError>;

    async fn keys_with_prefix(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError>;

    /// Drop entries whose TTL has elapsed, returning how many were removed
    async fn purge_expired(&self) -> std::result::Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store backend.
///
/// Versions come from one counter shared by all keys, so a key that is
/// deleted and recreated never reuses an old version.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
    next_version: AtomicU64,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            next_version: AtomicU64::new(1),
            available: AtomicBool::new(true),
            latency: Mutex::new(None),
        }
    }

    /// Simulate an outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call, to exercise caller deadlines
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.read_entries()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite raw bytes without bumping TTL semantics, for corruption tests
    pub fn corrupt(&self, key: &str, value: Vec<u8>) -> bool {
        let mut entries = self.write_entries();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    async fn enter(&self) -> std::result::Result<(), StoreError> {
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
            self.clock.now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }

    fn live_version(
        entries: &HashMap<String, MemoryEntry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.version)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<u64, StoreError> {
        self.enter().await?;
        let version = self.bump();
        let expires_at = self.expiry(ttl);
        self.write_entries().insert(
            key.to_string(),
            MemoryEntry {
                value,
                version,
                expires_at,
            },
        );
        Ok(version)
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<StoredValue>, StoreError> {
        self.enter().await?;
        let now = self.clock.now();
        Ok(self
            .read_entries()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| StoredValue {
                value: entry.value.clone(),
                version: entry.version,
                expires_at: entry.expires_at,
            }))
    }

    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        self.enter().await?;
        let now = self.clock.now();
        Ok(self
            .write_entries()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<u64, StoreError> {
        let batch = WriteBatch::new(ttl)
            .expect_version(key, expected)
            .put(key, value);
        let versions = self.commit(batch).await?;
        versions
            .get(key)
            .copied()
            .ok_or_else(|| StoreError::MissingKey(key.to_string()))
    }

    async fn commit(
        &self,
        batch: WriteBatch,
    ) -> std::result::Result<HashMap<String, u64>, StoreError> {
        self.enter().await?;
        let now = self.clock.now();
        let expires_at = self.expiry(batch.ttl);
        let mut entries = self.write_entries();

        for (key, expected) in &batch.assertions {
            let actual = Self::live_version(&entries, key, now);
            if actual != *expected {
                return Err(StoreError::VersionConflict {
                    key: key.clone(),
                    expected: *expected,
                    actual,
                });
            }
        }

        let mut pending: HashMap<&str, bool> = HashMap::new();
        for write in &batch.writes {
            match write {
                BatchWrite::Put { key, .. } => {
                    pending.insert(key.as_str(), true);
                }
                BatchWrite::Delete { key } => {
                    pending.insert(key.as_str(), false);
                }
                BatchWrite::Touch { key } => {
                    let exists = pending
                        .get(key.as_str())
                        .copied()
                        .unwrap_or_else(|| Self::live_version(&entries, key, now).is_some());
                    if !exists {
                        return Err(StoreError::MissingKey(key.clone()));
                    }
                }
            }
        }

        let mut versions = HashMap::new();
        for write in batch.writes {
            match write {
                BatchWrite::Put { key, value } => {
                    let version = self.bump();
                    versions.insert(key.clone(), version);
                    entries.insert(
                        key,
                        MemoryEntry {
                            value,
                            version,
                            expires_at,
                        },
                    );
                }
                BatchWrite::Delete { key } => {
                    versions.remove(&key);
                    entries.remove(&key);
                }
                BatchWrite::Touch { key } => {
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.expires_at = expires_at;
                        versions.insert(key, entry.version);
                    }
                }
            }
        }

        debug!("Committed batch touching {} keys", versions.len());
        Ok(versions)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
        self.enter().await?;
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .read_entries()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self) -> std::result::Result<usize, StoreError> {
        self.enter().await?;
        let now = self.clock.now();
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}

/// Store handle that enforces a deadline on every call.
///
/// A call that misses its deadline is reported as [`StoreError::Timeout`] and
/// treated as not applied; the future is dropped before it completes.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn SessionStore>,
    deadline: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn SessionStore>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    async fn within<T, F>(&self, op: &str, fut: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Store {} exceeded deadline of {:?}", op, self.deadline);
                Err(StoreError::Timeout(self.deadline))
            }
        }
    }

    pub async fn get(&self, key: &str) -> std::result::Result<Option<StoredValue>, StoreError> {
        debug!("Store get {}", key);
        self.within("get", self.store.get(key)).await
    }

    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<u64, StoreError> {
        debug!("Store put {}", key);
        self.within("put", self.store.put(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        debug!("Store delete {}", key);
        self.within("delete", self.store.delete(key)).await
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<u64, StoreError> {
        debug!("Store compare-and-swap {} (expected {:?})", key, expected);
        self.within("compare_and_swap", self.store.compare_and_swap(key, expected, value, ttl))
            .await
    }

    pub async fn commit(
        &self,
        batch: WriteBatch,
    ) -> std::result::Result<HashMap<String, u64>, StoreError> {
        debug!(
            "Store commit: {} assertions, {} writes",
            batch.assertions().len(),
            batch.writes().len()
        );
        self.within("commit", self.store.commit(batch)).await
    }

    pub async fn keys_with_prefix(
        &self,
        prefix: &str,
    ) -> std::result::Result<Vec<String>, StoreError> {
        self.within("keys_with_prefix", self.store.keys_with_prefix(prefix))
            .await
    }

    pub async fn purge_expired(&self) -> std::result::Result<usize, StoreError> {
        self.within("purge_expired", self.store.purge_expired()).await
    }

    /// Read and deserialize a JSON record with its version
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        match self.get(key).await? {
            Some(stored) => {
                let value = serde_json::from_slice(&stored.value).map_err(|e| {
                    EngineError::Corrupted(format!("failed to deserialize {}: {}", key, e))
                })?;
                Ok(Some(Versioned {
                    value,
                    version: stored.version,
                }))
            }
            None => Ok(None),
        }
    }
}

/// Serialize a record for storage
pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| EngineError::Corrupted(format!("failed to serialize record: {}", e)))
}
