//! Per-user live state: the session blob (2h sliding TTL) and per-thread
//! chat history (24h sliding TTL). Both live in the shared state store so
//! any instance can pick up a conversation; the session manager adds a
//! local read-through cache on top.

pub mod history;
pub mod session;

pub use history::{ChatHistoryManager, StoredMessage, ThreadHistory};
pub use session::{SessionState, SessionStateManager};
