//! In-process storage backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{effective_ttl, Storage, Value};
use crate::clock::{tick_interval, Clock, SystemClock};
use crate::error::{FluxError, Result};

/// Default number of entries a [`MemoryStorage`] holds before evicting.
pub const DEFAULT_MEMORY_CAPACITY: usize = 100_000;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

impl Entry {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bounded in-process key/value map with TTL expiry.
///
/// When an insert would exceed the capacity, the entry with the nearest
/// expiry is evicted. Entries written without a TTL are never chosen, so a
/// map full of TTL-less entries grows past its capacity rather than losing
/// data.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    /// Create a storage holding up to `capacity` entries, using the system clock.
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, SystemClock::shared())
    }

    /// Create a storage that reads time from `clock`.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            clock,
        }
    }

    /// Maximum number of entries before eviction kicks in.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of physically retained entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the storage holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Evict the entry with the nearest expiry if `key` would not fit.
    fn make_room(&self, entries: &mut HashMap<String, Entry>, key: &str) {
        if entries.len() < self.capacity || entries.contains_key(key) {
            return;
        }

        let victim = entries
            .iter()
            .filter_map(|(k, e)| e.expires_at.map(|at| (k, at)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(k, _)| k.clone());

        if let Some(victim) = victim {
            debug!(key = %victim, capacity = self.capacity, "Evicting entry to make room");
            entries.remove(&victim);
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }

        entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        let expires_at = effective_ttl(ttl).map(|t| now + t.as_secs_f64());
        let mut entries = self.entries.lock();

        self.make_room(&mut entries, key);
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            if !entry.is_expired(now) {
                let current = entry.value.as_f64().ok_or_else(|| FluxError::NotNumeric {
                    key: key.to_string(),
                })?;
                let updated = current + delta;
                entry.value = Value::Number(updated);
                return Ok(updated);
            }
        }

        // Absent or expired: start from zero with no expiry.
        self.make_room(&mut entries, key);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Number(delta),
                expires_at: None,
            },
        );
        Ok(delta)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            None => return Ok(false),
            Some(entry) if !entry.is_expired(now) => return Ok(true),
            Some(_) => {}
        }

        entries.remove(key);
        Ok(false)
    }
}

/// Periodically sweep expired entries out of `storage`.
///
/// The sweep runs on the tokio timer; abort the returned handle to stop it.
/// Periods below one millisecond are raised to one millisecond.
pub fn spawn_sweeper(storage: Arc<MemoryStorage>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tick_interval(every);
        loop {
            ticker.tick().await;
            let removed = storage.purge_expired();
            if removed > 0 {
                trace!(removed, "Swept expired entries");
            }
        }
    })
}
