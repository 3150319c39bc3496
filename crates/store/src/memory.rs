//! In-memory [`StateStore`] used by tests and `kv.memory = true` local
//! runs.
//!
//! TTLs are honored lazily: expired entries are dropped when read or
//! scanned. Pub/sub is a process-local fan-out with the same `*` pattern
//! semantics as the Redis PSUBSCRIBE glob.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ma_domain::stream::BoxStream;
use ma_domain::Result;

use crate::kv::{PubSubMessage, StateStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |t| Instant::now() < t)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<PubSubMessage>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Glob match supporting `*` (any run of characters), as PSUBSCRIBE and
    /// SCAN MATCH do for the patterns this codebase uses.
    pub fn pattern_matches(pattern: &str, value: &str) -> bool {
        fn inner(p: &[u8], v: &[u8]) -> bool {
            match (p.first(), v.first()) {
                (None, None) => true,
                (Some(b'*'), _) => {
                    inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
                }
                (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
                _ => false,
            }
        }
        inner(pattern.as_bytes(), value.as_bytes())
    }

    fn ttl_deadline(ttl_secs: Option<u64>) -> Option<Instant> {
        ttl_secs.map(|s| Instant::now() + Duration::from_secs(s))
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.live() => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::ttl_deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn setnx(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let mut entries = self.entries.lock();
        let occupied = entries.get(key).is_some_and(Entry::live);
        if occupied {
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::ttl_deadline(Some(ttl_secs)),
            },
        );
        true
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        self.hashes.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        if let Some(e) = self.entries.lock().get_mut(key) {
            e.expires_at = Self::ttl_deadline(Some(ttl_secs));
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.hashes
            .lock()
            .get(key)
            .and_then(|h| h.get(field).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        self.hashes.lock().get(key).cloned().unwrap_or_default()
    }

    async fn publish(&self, channel: &str, payload: &str) {
        let msg = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let mut subs = self.subscribers.lock();
        subs.retain(|(pattern, tx)| {
            if Self::pattern_matches(pattern, channel) {
                tx.send(msg.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, PubSubMessage>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((pattern.to_string(), tx));
        Ok(Box::pin(async_stream::stream! {
            while let Some(msg) = rx.recv().await {
                yield msg;
            }
        }))
    }

    async fn scan(&self, pattern: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.live());
        entries
            .keys()
            .filter(|k| Self::pattern_matches(pattern, k))
            .cloned()
            .collect()
    }
}
