//! Events published on the per-thread pub/sub channel.
//!
//! Subscribed WebSocket connections forward these verbatim. Stream chunks
//! carry a monotone `seq` so any single subscriber can verify ordering;
//! `accumulated` values form a prefix chain ending at the final
//! `full_content`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use ma_store::StateStore;

#[derive(Debug, Clone, Serialize)]
pub struct StreamMetadata {
    pub tokens_used: u32,
    pub duration_ms: u64,
    pub model: String,
    pub status: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadEvent {
    LlmStreamStart {
        message_id: i64,
        thread_key: String,
        space_code: String,
        timestamp: DateTime<Utc>,
    },
    LlmStreamChunk {
        message_id: i64,
        seq: u64,
        chunk: String,
        accumulated: String,
        is_final: bool,
    },
    LlmStreamComplete {
        message_id: i64,
        full_content: String,
        metadata: StreamMetadata,
    },
    LlmStreamInterrupted {
        message_id: i64,
        accumulated: String,
    },
    LlmStreamError {
        message_id: i64,
        error: String,
    },
    /// Checklist creation or step update, mirrored to the UI.
    #[serde(rename = "WORKFLOW_CHECKLIST")]
    WorkflowChecklist {
        command: String,
        payload: Value,
    },
}

/// Commands carried by `WORKFLOW_CHECKLIST` events.
pub const CMD_CREATE_CHECKLIST: &str = "CREATE_CHECKLIST";
pub const CMD_UPDATE_STEP_STATUS: &str = "UPDATE_STEP_STATUS";

/// Serialize and publish an event on a thread channel. Best effort: a
/// dropped event only degrades the live view, never the durable state.
pub async fn publish(store: &dyn StateStore, channel: &str, event: &ThreadEvent) {
    match serde_json::to_string(event) {
        Ok(payload) => store.publish(channel, &payload).await,
        Err(e) => tracing::warn!(channel, error = %e, "event serialization failed"),
    }
}
