//! Per-thread cancellation flags.
//!
//! Each running workflow registers a `CancelToken` under its thread
//! channel. `LLM.stop_streaming` flips the flag; the executor checks it at
//! every chunk boundary and seals the partial message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks active cancellation tokens per thread channel.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new cancel token for a channel.
    pub fn register(&self, channel: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(channel.to_owned(), token.clone());
        token
    }

    /// Cancel the running workflow on one channel. Returns true if a token
    /// was found.
    pub fn cancel(&self, channel: &str) -> bool {
        match self.tokens.lock().get(channel) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every channel starting with `prefix` (stop-streaming without
    /// a thread key covers all of a user's threads). Returns the number of
    /// workflows signalled.
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let tokens = self.tokens.lock();
        let mut n = 0;
        for (channel, token) in tokens.iter() {
            if channel.starts_with(prefix) {
                token.cancel();
                n += 1;
            }
        }
        n
    }

    /// Remove the token when a workflow finishes.
    pub fn remove(&self, channel: &str) {
        self.tokens.lock().remove(channel);
    }

    pub fn is_running(&self, channel: &str) -> bool {
        self.tokens.lock().contains_key(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_cancel_remove() {
        let map = CancelMap::new();
        let token = map.register("chat:u:c:t");
        assert!(map.is_running("chat:u:c:t"));
        assert!(!token.is_cancelled());

        assert!(map.cancel("chat:u:c:t"));
        assert!(token.is_cancelled());

        map.remove("chat:u:c:t");
        assert!(!map.is_running("chat:u:c:t"));
        assert!(!map.cancel("chat:u:c:t"));
    }

    #[test]
    fn prefix_cancel_covers_all_threads() {
        let map = CancelMap::new();
        let t1 = map.register("chat:u1:acme:t1");
        let t2 = map.register("chat:u1:acme:t2");
        let other = map.register("chat:u2:acme:t1");

        assert_eq!(map.cancel_prefix("chat:u1:acme:"), 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
