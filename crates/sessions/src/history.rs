//! Per-thread message history.
//!
//! The history blob is the working copy of a conversation: ordered
//! messages plus the thread's system prompt and mode. Message ids are
//! millisecond-precision integers with a collision-avoidance offset, so
//! ids are strictly increasing within a thread even for same-millisecond
//! appends.
//!
//! Appends are read-modify-write on the blob; the workflow executor
//! serializes writers per thread through the Brain, which is what makes
//! the append atomic in practice.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ma_domain::chat::{ChatMode, Role};
use ma_domain::{Error, Result};
use ma_store::{keys, StateStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set while an assistant message is still receiving stream chunks.
    /// A sealed message is immutable.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Structured tool payload (call arguments or result body).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_payload: Option<Value>,
}

/// Task-execution binding of a thread, present while the thread is driving
/// a task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub mandate_path: String,
    pub task_id: String,
    pub execution_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadHistory {
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub chat_mode: ChatMode,
    #[serde(default)]
    pub active_execution: Option<ActiveExecution>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChatHistoryManager {
    store: Arc<dyn StateStore>,
    history_ttl_secs: u64,
    /// Last id handed out. Ids are `unix_millis * 1000 + offset`; the
    /// counter guarantees strict monotonicity within this process.
    last_id: AtomicI64,
}

impl ChatHistoryManager {
    pub fn new(store: Arc<dyn StateStore>, history_ttl_secs: u64) -> Self {
        Self {
            store,
            history_ttl_secs,
            last_id: AtomicI64::new(0),
        }
    }

    /// Allocate the next message id: millisecond wall clock scaled by 1000,
    /// bumped past the previous id on same-millisecond collisions.
    pub fn next_message_id(&self) -> i64 {
        let candidate = Utc::now().timestamp_millis() * 1000;
        self.last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .map(|last| candidate.max(last + 1))
            .unwrap_or(candidate)
    }

    pub async fn load(&self, user: &str, company: &str, thread: &str) -> ThreadHistory {
        let key = keys::chat_history(user, company, thread);
        match self.store.get(&key).await {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "corrupt history blob, starting fresh");
                ThreadHistory::default()
            }),
            None => ThreadHistory::default(),
        }
    }

    /// Full overwrite. Used by append, streaming updates, and
    /// resummarization. Refreshes the sliding TTL.
    pub async fn save(
        &self,
        user: &str,
        company: &str,
        thread: &str,
        history: &ThreadHistory,
    ) -> Result<()> {
        let key = keys::chat_history(user, company, thread);
        let raw = serde_json::to_string(history)?;
        self.store
            .set(&key, &raw, Some(self.history_ttl_secs))
            .await
    }

    /// Append one message. The caller owns ordering; the id and timestamp
    /// assigned here are strictly non-decreasing.
    pub async fn append(
        &self,
        user: &str,
        company: &str,
        thread: &str,
        mut message: StoredMessage,
    ) -> Result<i64> {
        let mut history = self.load(user, company, thread).await;
        if message.id == 0 {
            message.id = self.next_message_id();
        }
        message.timestamp = Utc::now();
        let id = message.id;
        history.messages.push(message);
        history.last_activity = Some(Utc::now());
        self.save(user, company, thread, &history).await?;
        Ok(id)
    }

    /// Extend the content of an in-flight streaming message. Only the
    /// placeholder written for the active stream may be touched.
    pub async fn update_streaming(
        &self,
        user: &str,
        company: &str,
        thread: &str,
        message_id: i64,
        accumulated: &str,
    ) -> Result<()> {
        let mut history = self.load(user, company, thread).await;
        let msg = history
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;
        if !msg.streaming {
            return Err(Error::InvalidArgs(format!(
                "message {message_id} is sealed and immutable"
            )));
        }
        msg.content = accumulated.to_string();
        self.save(user, company, thread, &history).await
    }

    /// Seal a streaming message with its final content.
    pub async fn seal(
        &self,
        user: &str,
        company: &str,
        thread: &str,
        message_id: i64,
        final_content: &str,
    ) -> Result<()> {
        let mut history = self.load(user, company, thread).await;
        let msg = history
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;
        msg.content = final_content.to_string();
        msg.streaming = false;
        self.save(user, company, thread, &history).await
    }

    pub async fn clear(&self, user: &str, company: &str, thread: &str) -> Result<()> {
        self.store
            .del(&keys::chat_history(user, company, thread))
            .await
    }

    /// Refresh the sliding TTL without rewriting the blob.
    pub async fn touch(&self, user: &str, company: &str, thread: &str) {
        let key = keys::chat_history(user, company, thread);
        if let Err(e) = self.store.expire(&key, self.history_ttl_secs).await {
            tracing::debug!(key, error = %e, "history TTL refresh failed");
        }
    }
}

impl StoredMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(Role::System, content)
    }

    /// Placeholder for a streaming assistant response.
    pub fn streaming_placeholder() -> Self {
        let mut m = Self::bare(Role::Assistant, "");
        m.streaming = true;
        m
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        let mut m = Self::bare(Role::Tool, content);
        m.tool_call_id = Some(call_id.into());
        m.tool_name = Some(tool_name.into());
        m.tool_payload = payload;
        m
    }

    fn bare(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            role,
            content: content.into(),
            timestamp: Utc::now(),
            streaming: false,
            tool_call_id: None,
            tool_name: None,
            tool_payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ma_store::MemoryStore;

    fn manager() -> ChatHistoryManager {
        ChatHistoryManager::new(Arc::new(MemoryStore::new()), 24 * 3600)
    }

    #[tokio::test]
    async fn append_then_load_last_is_the_appended() {
        let mgr = manager();
        mgr.append("u", "c", "t", StoredMessage::user("hello"))
            .await
            .unwrap();
        let id = mgr
            .append("u", "c", "t", StoredMessage::assistant("hi"))
            .await
            .unwrap();
        let history = mgr.load("u", "c", "t").await;
        assert_eq!(history.messages.len(), 2);
        let last = history.messages.last().unwrap();
        assert_eq!(last.id, id);
        assert_eq!(last.content, "hi");
    }

    #[tokio::test]
    async fn message_ids_strictly_increase() {
        let mgr = manager();
        let mut prev = 0;
        for i in 0..50 {
            let id = mgr
                .append("u", "c", "t", StoredMessage::user(format!("m{i}")))
                .await
                .unwrap();
            assert!(id > prev, "id {id} not greater than {prev}");
            prev = id;
        }
    }

    #[tokio::test]
    async fn timestamps_non_decreasing() {
        let mgr = manager();
        for i in 0..10 {
            mgr.append("u", "c", "t", StoredMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let history = mgr.load("u", "c", "t").await;
        for pair in history.messages.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn streaming_update_then_seal() {
        let mgr = manager();
        let id = mgr
            .append("u", "c", "t", StoredMessage::streaming_placeholder())
            .await
            .unwrap();

        mgr.update_streaming("u", "c", "t", id, "Hel").await.unwrap();
        mgr.update_streaming("u", "c", "t", id, "Hello").await.unwrap();
        mgr.seal("u", "c", "t", id, "Hello world").await.unwrap();

        let history = mgr.load("u", "c", "t").await;
        let msg = history.messages.iter().find(|m| m.id == id).unwrap();
        assert_eq!(msg.content, "Hello world");
        assert!(!msg.streaming);

        // Sealed messages are immutable.
        let err = mgr.update_streaming("u", "c", "t", id, "more").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn clear_removes_history() {
        let mgr = manager();
        mgr.append("u", "c", "t", StoredMessage::user("x"))
            .await
            .unwrap();
        mgr.clear("u", "c", "t").await.unwrap();
        assert!(mgr.load("u", "c", "t").await.messages.is_empty());
    }

    #[tokio::test]
    async fn histories_are_thread_scoped() {
        let mgr = manager();
        mgr.append("u", "c", "t1", StoredMessage::user("one"))
            .await
            .unwrap();
        mgr.append("u", "c", "t2", StoredMessage::user("two"))
            .await
            .unwrap();
        assert_eq!(mgr.load("u", "c", "t1").await.messages.len(), 1);
        assert_eq!(mgr.load("u", "c", "t2").await.messages.len(), 1);
    }
}
