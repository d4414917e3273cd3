//! Redis-backed storage implementation.
//!
//! Every operation is a single round trip. Increments use the server's
//! native `INCRBYFLOAT`, and multi-step read/compare/write sequences are
//! shipped as Lua scripts through [`RedisStorage::eval_script`] so no other
//! client can interleave with them.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, FromRedisValue, Script};
use std::fmt;
use std::time::Duration;
use std::time::Instant;
use tracing::{info, trace};

use super::{effective_ttl, Storage, Value};
use crate::error::Result;

/// Configuration for Redis storage.
#[derive(Debug, Clone, Default)]
pub struct RedisStorageConfig {
    /// Prefix prepended to every key (default: none)
    pub key_prefix: String,
}

/// Storage backed by a Redis server.
///
/// Redis keeps every value as a string, so `get` decodes by shape: text that
/// parses as a finite number reads back as [`Value::Number`]. A value stored
/// as `Value::Text("42")` is returned as `Value::Number(42.0)`; everything
/// else reads back unchanged.
///
/// Cloning is cheap: clones share the same multiplexed connection.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    config: RedisStorageConfig,
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStorageConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStorageConfig) -> Result<Self> {
        let started = Instant::now();
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(
            prefix = %config.key_prefix,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connected to Redis"
        );

        Ok(Self { connection, config })
    }

    /// Full Redis key for a storage key.
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Execute a Lua script atomically.
    ///
    /// `keys` are prefixed the same way as every other operation; `args` are
    /// passed through as-is. The script is sent with `EVALSHA` and falls back
    /// to `EVAL` when the server has not cached it yet.
    pub async fn eval_script<T: FromRedisValue>(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[Value],
    ) -> Result<T> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(self.key(key));
        }
        for arg in args {
            invocation.arg(arg);
        }

        trace!(keys = ?keys, "Evaluating script");
        let mut conn = self.connection.clone();
        Ok(invocation.invoke_async(&mut conn).await?)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.key(key)).await?;
        Ok(raw.map(Value::from_stored))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        let key = self.key(key);

        match effective_ttl(ttl) {
            Some(ttl) => {
                // Sub-millisecond TTLs would be rejected by PSETEX.
                let millis = (ttl.as_millis() as u64).max(1);
                let _: () = redis::cmd("PSETEX")
                    .arg(key)
                    .arg(millis)
                    .arg(&value)
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                conn.set::<_, _, ()>(key, &value).await?;
            }
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64> {
        let mut conn = self.connection.clone();
        let updated: f64 = redis::cmd("INCRBYFLOAT")
            .arg(self.key(key))
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let found: i64 = conn.exists(self.key(key)).await?;
        Ok(found > 0)
    }
}
