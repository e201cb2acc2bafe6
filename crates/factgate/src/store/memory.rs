use crate::{
    error::Result,
    store::{Fields, StorageBackend},
    time::{Clock, MonotonicClock},
};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::HashMap, sync::Arc};

/// An expired-key sweep runs roughly once per this many mutating operations.
const EVICTION_INTERVAL: u64 = 128;

#[derive(Clone, Debug)]
struct Entry {
    fields: Fields,
    expires_at: Option<f64>,
}

/// A key copied out of a [`MemoryStore`] together with its remaining TTL.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub key: String,
    pub fields: Fields,
    pub ttl: Option<Duration>,
}

/// In-process [`StorageBackend`] with the same semantics as the remote one.
///
/// Used as the limiter's local fallback and as the only store when no remote
/// is configured. It is owned by a single service instance and never shared
/// across processes.
///
/// Expired keys are dropped lazily when touched, and a periodic sweep removes
/// the ones nobody touches again so abandoned identities do not accumulate.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    ops: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store driven by a [`MonotonicClock`].
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Creates an empty store that reads expiry deadlines from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            ops: AtomicU64::new(0),
        }
    }

    /// Returns the fields under `key`, or an empty map if missing/expired.
    pub fn read(&self, key: &str) -> Fields {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if is_expired(entry, now) => {
                entries.remove(key);
                Fields::new()
            }
            Some(entry) => entry.fields.clone(),
            None => Fields::new(),
        }
    }

    /// Merges `fields` into `key`, creating it if needed.
    pub fn write(&self, key: &str, fields: &Fields) {
        self.maybe_evict_expired();
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
            fields: Fields::new(),
            expires_at: None,
        });
        if is_expired(entry, now) {
            entry.fields.clear();
            entry.expires_at = None;
        }
        entry
            .fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Sets the TTL of `key`; a zero TTL deletes it.
    pub fn set_ttl(&self, key: &str, ttl: Duration) {
        let mut entries = self.entries.lock();
        if ttl.is_zero() {
            entries.remove(key);
            return;
        }
        let deadline = self.clock.now() + ttl.as_secs_f64();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .values()
            .filter(|entry| !is_expired(entry, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out every live key with its remaining TTL.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        let now = self.clock.now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| !is_expired(entry, now))
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                fields: entry.fields.clone(),
                ttl: entry
                    .expires_at
                    .map(|deadline| Duration::from_secs_f64((deadline - now).max(0.0))),
            })
            .collect()
    }

    /// Removes every key.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn stored_keys(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drops expired entries, roughly once every [`EVICTION_INTERVAL`] writes.
    fn maybe_evict_expired(&self) {
        let count = self.ops.fetch_add(1, Ordering::Relaxed);
        if count % EVICTION_INTERVAL != 0 {
            return;
        }
        let now = self.clock.now();
        self.entries.lock().retain(|_, entry| !is_expired(entry, now));
    }
}

fn is_expired(entry: &Entry, now: f64) -> bool {
    entry.expires_at.is_some_and(|deadline| now >= deadline)
}

#[async_trait]
impl StorageBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_all(&self, key: &str) -> Result<Fields> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, fields: &Fields) -> Result<()> {
        self.write(key, fields);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.set_ttl(key, ttl);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        self.write(key, fields);
        self.set_ttl(key, ttl);
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.clear();
    }
}
