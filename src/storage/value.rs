//! Scalar values held by a storage backend.

use redis::{RedisWrite, ToRedisArgs};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stored scalar: either a number or an arbitrary string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Numeric value, the only kind `incr`/`decr` operate on
    Number(f64),
    /// Any other scalar
    Text(String),
}

impl Value {
    /// Interpret the value as a number.
    ///
    /// Text that parses as a finite float counts as numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => parse_finite(s),
        }
    }

    /// Borrow the value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Number(_) => None,
        }
    }

    /// Decode a raw string read back from a remote store.
    ///
    /// The original variant is not recorded, so numeric text becomes a number.
    pub(crate) fn from_stored(raw: String) -> Self {
        match parse_finite(&raw) {
            Some(n) => Value::Number(n),
            None => Value::Text(raw),
        }
    }
}

fn parse_finite(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl ToRedisArgs for Value {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        match self {
            Value::Number(n) => n.write_redis_args(out),
            Value::Text(s) => s.write_redis_args(out),
        }
    }
}
