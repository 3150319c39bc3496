//! The Brain: per-thread in-memory projection of history + session + tool
//! bindings, and the cache that owns one per active thread.
//!
//! The Brain's tokio mutex doubles as the per-thread serializer: whoever
//! holds the guard is the only writer of that thread's history. All
//! durable state lives in the stores, so losing a Brain (eviction,
//! instance death) only costs a rebuild.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use ma_domain::chat::ChatMode;
use ma_domain::stream::Usage;
use ma_domain::task::{ExecutionReport, Mission};
use ma_domain::{Error, Result};
use ma_sessions::history::ActiveExecution;
use ma_sessions::{ChatHistoryManager, SessionState, SessionStateManager, ThreadHistory};

use super::prompts;

/// Crude context estimate used before the first provider call reports real
/// usage: ~4 characters per token.
pub fn estimate_tokens(text_len: usize) -> u32 {
    (text_len / 4) as u32
}

#[derive(Debug)]
pub struct Brain {
    pub user_id: String,
    pub company_id: String,
    pub thread_key: String,
    pub chat_mode: ChatMode,
    pub system_prompt: String,
    /// Read-through snapshot of the owning session.
    pub session: SessionState,
    /// Working copy of the thread history. The Brain is the authoritative
    /// writer while it holds the thread.
    pub history: ThreadHistory,
    /// Tokens in the current context window (from the last provider call,
    /// or an estimate before one happened).
    pub token_count: u32,
    pub active_task: Option<ActiveExecution>,
    /// Coalesces concurrent resummarization attempts.
    pub summarizing: bool,
    initialized: bool,
}

impl Brain {
    fn empty(user: &str, company: &str, thread: &str) -> Self {
        Self {
            user_id: user.to_string(),
            company_id: company.to_string(),
            thread_key: thread.to_string(),
            chat_mode: ChatMode::GeneralChat,
            system_prompt: String::new(),
            session: SessionState {
                user_id: user.to_string(),
                company_id: company.to_string(),
                mandate_path: String::new(),
                country: None,
                timezone: None,
                user_language: None,
                dms_system: None,
                job_metrics: serde_json::Value::Null,
                active_threads: Default::default(),
                created_at: chrono::Utc::now(),
            },
            history: ThreadHistory::default(),
            token_count: 0,
            active_task: None,
            summarizing: false,
            initialized: false,
        }
    }

    /// Bind this Brain to a task execution: task-mode prompt with the
    /// mission and previous report, checklist tools enabled.
    pub fn bind_task(
        &mut self,
        active: ActiveExecution,
        mission: &Mission,
        last_report: Option<&ExecutionReport>,
    ) {
        self.chat_mode = ChatMode::TaskExecution;
        self.system_prompt = prompts::build_system_prompt(
            self.chat_mode,
            &self.session,
            Some(mission),
            last_report,
        );
        self.history.active_execution = Some(active.clone());
        self.history.chat_mode = self.chat_mode;
        self.history.system_prompt = Some(self.system_prompt.clone());
        self.active_task = Some(active);
    }

    /// Switch to callback-resumption mode (keeps the active task binding).
    pub fn enter_callback_mode(&mut self) {
        self.chat_mode = ChatMode::LptCallback;
        self.system_prompt =
            prompts::build_system_prompt(self.chat_mode, &self.session, None, None);
        self.history.chat_mode = self.chat_mode;
        self.history.system_prompt = Some(self.system_prompt.clone());
    }

    /// Record real usage from a provider call. `prompt_tokens` already
    /// covers the whole context window, so this replaces the estimate.
    pub fn record_usage(&mut self, usage: &Usage) {
        self.token_count = usage.prompt_tokens + usage.completion_tokens;
    }

    pub fn streaming_channel(&self) -> String {
        ma_store::keys::chat_channel(&self.user_id, &self.company_id, &self.thread_key)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BrainCache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// At most one Brain per thread key per instance.
#[derive(Default)]
pub struct BrainCache {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<Brain>>>>,
}

fn cache_key(user: &str, company: &str, thread: &str) -> String {
    format!("{user}:{company}:{thread}")
}

impl BrainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the thread's Brain, rebuilding it from stores on a cache
    /// miss. `wait = false` rejects with `ThreadBusy` when another caller
    /// holds the thread; `wait = true` queues behind it.
    pub async fn acquire(
        &self,
        sessions: &SessionStateManager,
        history: &ChatHistoryManager,
        user: &str,
        company: &str,
        thread: &str,
        requested_mode: Option<ChatMode>,
        wait: bool,
    ) -> Result<OwnedMutexGuard<Brain>> {
        let handle = {
            let mut map = self.inner.lock();
            map.entry(cache_key(user, company, thread))
                .or_insert_with(|| Arc::new(AsyncMutex::new(Brain::empty(user, company, thread))))
                .clone()
        };

        let mut guard = if wait {
            handle.lock_owned().await
        } else {
            handle.try_lock_owned().map_err(|_| {
                Error::ThreadBusy(format!("thread {thread} has a turn in progress"))
            })?
        };

        if !guard.initialized {
            Self::rebuild(&mut guard, sessions, history, requested_mode).await?;
        } else if let Some(mode) = requested_mode {
            if mode != guard.chat_mode {
                guard.chat_mode = mode;
                guard.system_prompt =
                    prompts::build_system_prompt(mode, &guard.session, None, None);
                guard.history.chat_mode = mode;
                guard.history.system_prompt = Some(guard.system_prompt.clone());
            }
        }

        Ok(guard)
    }

    /// Rebuild the projection from the session + history stores.
    async fn rebuild(
        brain: &mut Brain,
        sessions: &SessionStateManager,
        history_mgr: &ChatHistoryManager,
        requested_mode: Option<ChatMode>,
    ) -> Result<()> {
        let session = sessions.ensure(&brain.user_id, &brain.company_id).await?;
        let history = history_mgr
            .load(&brain.user_id, &brain.company_id, &brain.thread_key)
            .await;

        brain.chat_mode = requested_mode.unwrap_or(history.chat_mode);
        brain.system_prompt = history.system_prompt.clone().unwrap_or_else(|| {
            prompts::build_system_prompt(brain.chat_mode, &session, None, None)
        });
        brain.active_task = history.active_execution.clone();
        brain.token_count = estimate_tokens(
            brain.system_prompt.len()
                + history.messages.iter().map(|m| m.content.len()).sum::<usize>(),
        );
        brain.session = session;
        brain.history = history;
        brain.initialized = true;
        tracing::debug!(
            thread = %brain.thread_key,
            mode = brain.chat_mode.as_str(),
            messages = brain.history.messages.len(),
            "brain rebuilt"
        );
        Ok(())
    }

    /// Drop one thread's Brain.
    pub fn evict(&self, user: &str, company: &str, thread: &str) {
        self.inner.lock().remove(&cache_key(user, company, thread));
    }

    /// Drop every Brain bound to a session (session flush).
    pub fn evict_session(&self, user: &str, company: &str) {
        let prefix = format!("{user}:{company}:");
        self.inner.lock().retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ma_docstore::{paths, DocumentStore, MemoryDocStore};
    use ma_store::MemoryStore;
    use serde_json::json;

    async fn deps() -> (Arc<SessionStateManager>, Arc<ChatHistoryManager>) {
        let store: Arc<dyn ma_store::StateStore> = Arc::new(MemoryStore::new());
        let docs = Arc::new(MemoryDocStore::new());
        docs.set_doc(
            &paths::user_company_doc("u1", "acme"),
            json!({"mandate_path": "clients/acme", "country": "CH"}),
        )
        .await
        .unwrap();
        (
            Arc::new(SessionStateManager::new(store.clone(), docs, 7200)),
            Arc::new(ChatHistoryManager::new(store, 86400)),
        )
    }

    #[tokio::test]
    async fn acquire_rebuilds_on_miss() {
        let (sessions, history) = deps().await;
        let cache = BrainCache::new();
        let brain = cache
            .acquire(&sessions, &history, "u1", "acme", "t1", None, false)
            .await
            .unwrap();
        assert_eq!(brain.session.mandate_path, "clients/acme");
        assert_eq!(brain.chat_mode, ChatMode::GeneralChat);
        assert!(!brain.system_prompt.is_empty());
    }

    #[tokio::test]
    async fn second_acquire_without_wait_is_busy() {
        let (sessions, history) = deps().await;
        let cache = BrainCache::new();
        let _held = cache
            .acquire(&sessions, &history, "u1", "acme", "t1", None, false)
            .await
            .unwrap();
        let err = cache
            .acquire(&sessions, &history, "u1", "acme", "t1", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ThreadBusy(_)));
    }

    #[tokio::test]
    async fn waiting_acquire_proceeds_after_release() {
        let (sessions, history) = deps().await;
        let cache = Arc::new(BrainCache::new());
        let guard = cache
            .acquire(&sessions, &history, "u1", "acme", "t1", None, false)
            .await
            .unwrap();

        let c2 = cache.clone();
        let (s2, h2) = (sessions.clone(), history.clone());
        let waiter = tokio::spawn(async move {
            c2.acquire(&s2, &h2, "u1", "acme", "t1", None, true)
                .await
                .map(|_| 42)
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(guard);
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn mode_switch_rebuilds_prompt() {
        let (sessions, history) = deps().await;
        let cache = BrainCache::new();
        {
            let _ = cache
                .acquire(&sessions, &history, "u1", "acme", "t1", None, false)
                .await
                .unwrap();
        }
        let brain = cache
            .acquire(
                &sessions,
                &history,
                "u1",
                "acme",
                "t1",
                Some(ChatMode::BankerChat),
                false,
            )
            .await
            .unwrap();
        assert_eq!(brain.chat_mode, ChatMode::BankerChat);
        assert!(brain.system_prompt.contains("bank reconciliation specialist"));
    }

    #[tokio::test]
    async fn evict_session_drops_all_threads() {
        let (sessions, history) = deps().await;
        let cache = BrainCache::new();
        for t in ["t1", "t2"] {
            let _ = cache
                .acquire(&sessions, &history, "u1", "acme", t, None, false)
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        cache.evict_session("u1", "acme");
        assert!(cache.is_empty());
    }
}
