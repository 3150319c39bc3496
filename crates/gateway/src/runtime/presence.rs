//! User presence and per-channel subscription tracking.
//!
//! Connections are owned by the WebSocket hub; this registry only counts
//! them. The count is mirrored into the state store with a TTL so an
//! executor on another instance can answer "is anyone watching channel X"
//! — the only question the runtime ever asks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ma_store::{keys, StateStore};

pub struct PresenceRegistry {
    store: Arc<dyn StateStore>,
    /// channel -> live local connection count.
    channels: Mutex<HashMap<String, usize>>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, channel: &str, user: &str) {
        {
            let mut channels = self.channels.lock();
            *channels.entry(channel.to_string()).or_insert(0) += 1;
        }
        let _ = self
            .store
            .set(
                &keys::channel_presence(channel),
                "1",
                Some(keys::PRESENCE_TTL_SECS),
            )
            .await;
        self.heartbeat(user).await;
        tracing::debug!(channel, user, "ws subscription registered");
    }

    pub async fn unregister(&self, channel: &str) {
        let emptied = {
            let mut channels = self.channels.lock();
            if let Some(count) = channels.get_mut(channel) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    channels.remove(channel);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if emptied {
            let _ = self.store.del(&keys::channel_presence(channel)).await;
        }
    }

    /// Record a frontend session for a user. Sessions are hash fields on
    /// the user's presence entry so several tabs coexist.
    pub async fn register_session(&self, user: &str, session_id: &str) {
        let key = keys::presence(user);
        let _ = self
            .store
            .hset(&key, session_id, &chrono::Utc::now().to_rfc3339())
            .await;
        let _ = self.store.expire(&key, keys::PRESENCE_TTL_SECS).await;
    }

    /// Refresh the user's heartbeat entry.
    pub async fn heartbeat(&self, user: &str) {
        let key = keys::presence(user);
        let _ = self
            .store
            .hset(&key, "last_seen", &chrono::Utc::now().to_rfc3339())
            .await;
        let _ = self.store.expire(&key, keys::PRESENCE_TTL_SECS).await;
    }

    pub async fn is_user_online(&self, user: &str) -> bool {
        !self.store.hgetall(&keys::presence(user)).await.is_empty()
    }

    pub async fn unregister_user(&self, user: &str) {
        let _ = self.store.del(&keys::presence(user)).await;
    }

    /// Is anyone, on any instance, subscribed to this channel?
    pub async fn is_connected(&self, channel: &str) -> bool {
        if self.channels.lock().contains_key(channel) {
            return true;
        }
        self.store
            .get(&keys::channel_presence(channel))
            .await
            .is_some()
    }

    /// Local subscription count (monitoring).
    pub fn local_channels(&self) -> usize {
        self.channels.lock().len()
    }
}
