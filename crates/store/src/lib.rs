//! Volatile-but-shared state: the one mutable resource all Maestro
//! instances share.
//!
//! Everything goes through the [`StateStore`] trait so the rest of the
//! system never sees a Redis type: production uses [`RedisStore`], tests
//! and local development use [`MemoryStore`].

pub mod keys;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod redis_store;

pub use kv::{PubSubMessage, StateStore};
pub use lock::LockGuard;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
