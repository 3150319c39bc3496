//! The state-store contract.
//!
//! Failure semantics are part of the contract: when the store is
//! unreachable, reads degrade to *absent*, writes log and return an error
//! the caller may ignore, and `setnx` reports the lock as **lost**
//! (fail-closed). Callers that want fail-open behavior opt in explicitly
//! at their own call site.

use std::collections::HashMap;

use ma_domain::stream::BoxStream;
use ma_domain::Result;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key. Absent and unreachable-store both read as `None`.
    async fn get(&self, key: &str) -> Option<String>;

    /// Write a key, optionally with a TTL in seconds.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Atomic set-if-not-exists with TTL. Returns `true` only when this
    /// caller created the key. A store failure reads as *not acquired*.
    async fn setnx(&self, key: &str, value: &str, ttl_secs: u64) -> bool;

    async fn del(&self, key: &str) -> Result<()>;

    /// Refresh a key's TTL (sliding expiry).
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Option<String>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hgetall(&self, key: &str) -> HashMap<String, String>;

    /// Best-effort broadcast; delivery failures are logged, never surfaced.
    async fn publish(&self, channel: &str, payload: &str);

    /// Subscribe to a channel pattern (`*` wildcard). The stream ends when
    /// the subscriber is dropped or the connection dies.
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, PubSubMessage>>;

    /// Collect all keys matching a pattern. An unreachable store yields an
    /// empty set.
    async fn scan(&self, pattern: &str) -> Vec<String>;
}
