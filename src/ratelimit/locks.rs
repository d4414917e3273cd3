//! Fixed-size lock table serializing read-modify-write cycles per key.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// Default number of lock shards per limiter.
pub const DEFAULT_LOCK_SHARDS: usize = 64;

/// A table of async mutexes addressed by a hash of the key.
///
/// Two operations on the same key always take the same shard, so their
/// load/compute/store sequences never interleave. Distinct keys may share a
/// shard; memory stays bounded no matter how many keys are seen.
#[derive(Debug)]
pub struct KeyLocks {
    shards: Box<[Mutex<()>]>,
}

impl KeyLocks {
    /// Create a table with `shards` locks (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    /// Number of shards in the table.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Wait for the lock guarding `key`.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_for(key)].lock().await
    }

    fn shard_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_SHARDS)
    }
}
