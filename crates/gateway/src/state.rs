use std::sync::Arc;

use ma_docstore::DocumentStore;
use ma_domain::config::Config;
use ma_providers::LlmProvider;
use ma_sessions::{ChatHistoryManager, SessionStateManager};
use ma_store::StateStore;

use crate::runtime::brain::BrainCache;
use crate::runtime::cancel::CancelMap;
use crate::runtime::presence::PresenceRegistry;
use crate::workers::WorkerSubmitter;

/// Shared application state passed to all API handlers and runtime tasks.
///
/// Fields are grouped by concern:
/// - **External adapters** — state store, document store, LLM provider,
///   worker client
/// - **Session & history** — session manager, history manager, Brain cache
/// - **Runtime** — presence registry, cancellation map
/// - **Security** — startup-hashed bearer tokens
#[derive(Clone)]
pub struct AppState {
    // ── External adapters ─────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<dyn StateStore>,
    pub docs: Arc<dyn DocumentStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub workers: Arc<dyn WorkerSubmitter>,

    // ── Session & history ─────────────────────────────────────────────
    pub sessions: Arc<SessionStateManager>,
    pub history: Arc<ChatHistoryManager>,
    pub brains: Arc<BrainCache>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub presence: Arc<PresenceRegistry>,
    pub cancel: Arc<CancelMap>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the frontend bearer token. `None` = dev mode.
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the worker-callback bearer token. `None` = dev mode.
    pub callback_token_hash: Option<Vec<u8>>,
}
