//! Named distributed locks over the state store.
//!
//! Acquisition is an atomic set-if-not-exists with a TTL; the value is the
//! holder's id so release can refuse to free another holder's lock. A
//! holder that dies without releasing is covered by the TTL.

use std::sync::Arc;

use uuid::Uuid;

use crate::kv::StateStore;

pub struct LockGuard {
    store: Arc<dyn StateStore>,
    key: String,
    holder: String,
}

impl LockGuard {
    /// Try to take the named lock. `None` means somebody else holds it —
    /// or the store is unreachable, which reads the same way.
    pub async fn acquire(
        store: Arc<dyn StateStore>,
        key: impl Into<String>,
        ttl_secs: u64,
    ) -> Option<LockGuard> {
        let key = key.into();
        let holder = Uuid::new_v4().to_string();
        if store.setnx(&key, &holder, ttl_secs).await {
            Some(LockGuard { store, key, holder })
        } else {
            None
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Refresh the TTL while long work is still in progress.
    pub async fn extend(&self, ttl_secs: u64) {
        if let Err(e) = self.store.expire(&self.key, ttl_secs).await {
            tracing::warn!(key = %self.key, error = %e, "lock extend failed");
        }
    }

    /// Release the lock if we still hold it. Compares the stored holder id
    /// first so an expired-and-reacquired lock is never freed from here.
    pub async fn release(self) {
        match self.store.get(&self.key).await {
            Some(v) if v == self.holder => {
                if let Err(e) = self.store.del(&self.key).await {
                    tracing::warn!(key = %self.key, error = %e, "lock release failed");
                }
            }
            Some(_) => {
                tracing::warn!(key = %self.key, "lock expired and was taken over; not releasing");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn store() -> Arc<dyn StateStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn exclusive_acquire() {
        let store = store();
        let guard = LockGuard::acquire(store.clone(), "lock:cron:tick", 60)
            .await
            .expect("first acquire");
        assert!(
            LockGuard::acquire(store.clone(), "lock:cron:tick", 60)
                .await
                .is_none(),
            "second acquire must lose"
        );
        guard.release().await;
        assert!(LockGuard::acquire(store, "lock:cron:tick", 60).await.is_some());
    }

    #[tokio::test]
    async fn release_refuses_foreign_lock() {
        let store = store();
        let guard = LockGuard::acquire(store.clone(), "lock:x", 0).await.unwrap();
        // TTL elapsed; another instance takes the lock.
        let other = LockGuard::acquire(store.clone(), "lock:x", 60).await.unwrap();
        let other_holder = other.holder().to_string();

        // The stale guard must not free the new holder's lock.
        guard.release().await;
        assert_eq!(store.get("lock:x").await.as_deref(), Some(other_holder.as_str()));
    }

    #[tokio::test]
    async fn holder_value_is_written() {
        let store = store();
        let guard = LockGuard::acquire(store.clone(), "lock:y", 60).await.unwrap();
        assert_eq!(
            store.get("lock:y").await.as_deref(),
            Some(guard.holder())
        );
    }
}
