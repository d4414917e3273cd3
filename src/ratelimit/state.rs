//! Persisted per-key limiter state.
//!
//! Bucket limiters store `(value, updated_at)` as one JSON record so a
//! single `set` commits the whole state. An attempt abandoned mid-flight
//! either wrote the new record or left the old one untouched.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{FluxError, Result};
use crate::storage::{Storage, Value};

/// Stored bucket state: token count or fill level, and when it was computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub value: f64,
    pub updated_at: f64,
}

/// Load the snapshot at `key`.
///
/// Records that do not decode are logged and treated as absent, which
/// resets the key to its initial state.
pub(crate) async fn load(storage: &dyn Storage, key: &str) -> Result<Option<Snapshot>> {
    let raw = match storage.get(key).await? {
        Some(Value::Text(raw)) => raw,
        Some(Value::Number(n)) => {
            warn!(key = %key, value = n, "Discarding non-record limiter state");
            return Ok(None);
        }
        None => return Ok(None),
    };

    match serde_json::from_str(&raw) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(key = %key, error = %e, "Discarding corrupt limiter state");
            Ok(None)
        }
    }
}

/// Store `snapshot` at `key`, expiring after `ttl` of inactivity.
pub(crate) async fn store(
    storage: &dyn Storage,
    key: &str,
    snapshot: Snapshot,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(&snapshot).map_err(|e| FluxError::Storage(e.to_string()))?;
    storage.set(key, Value::Text(raw), ttl).await
}

/// Idle TTL after which a record is equivalent to a fresh one.
///
/// `settle_secs` is the time a bucket needs to return to its initial state;
/// one extra second absorbs rounding in the backend's TTL resolution.
pub(crate) fn idle_ttl(settle_secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(settle_secs.ceil() + 1.0).ok()
}
