//! The per-(user, company) session: profile snapshot, job metrics, and the
//! set of active threads.
//!
//! Hybrid local+remote: reads hit the process-local cache first and fall
//! through to the state store; writes go to both. Materialization is
//! deduplicated across instances with the `llm_init` lock so the expensive
//! profile fetch happens once per session, not once per caller.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ma_docstore::{paths, DocumentStore};
use ma_domain::{Error, Result};
use ma_store::{keys, StateStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub user_id: String,
    pub company_id: String,
    pub mandate_path: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub user_language: Option<String>,
    #[serde(default)]
    pub dms_system: Option<String>,
    #[serde(default)]
    pub job_metrics: Value,
    #[serde(default)]
    pub active_threads: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

pub struct SessionStateManager {
    store: Arc<dyn StateStore>,
    docs: Arc<dyn DocumentStore>,
    session_ttl_secs: u64,
    local: RwLock<HashMap<(String, String), SessionState>>,
}

impl SessionStateManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        docs: Arc<dyn DocumentStore>,
        session_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            docs,
            session_ttl_secs,
            local: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent session materialization.
    ///
    /// Fast path: local cache or store hit, TTL refreshed. Slow path: the
    /// `llm_init` lock elects one initializer; everyone else polls the
    /// session key until it appears, then re-attempts once.
    pub async fn ensure(&self, user: &str, company: &str) -> Result<SessionState> {
        for attempt in 0..2 {
            if let Some(session) = self.lookup(user, company).await {
                self.touch(user, company).await;
                return Ok(session);
            }

            let init_key = keys::llm_init(user, company);
            if self
                .store
                .setnx(&init_key, "initializing", keys::LLM_INIT_TTL_SECS)
                .await
            {
                let result = self.materialize(user, company).await;
                // Release the init key whatever happened so a failed init
                // does not block retries for five minutes.
                let _ = self.store.del(&init_key).await;
                return result;
            }

            // Lost the init race: wait for the winner to publish.
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                if let Some(session) = self.read_remote(user, company).await {
                    self.cache_local(session.clone());
                    return Ok(session);
                }
            }
            tracing::debug!(user, company, attempt, "session init winner never published, re-attempting");
        }
        Err(Error::Store(format!(
            "session init for {user}:{company} did not converge"
        )))
    }

    /// Fetch profile, job metrics, and workflow parameters and persist the
    /// fresh session.
    async fn materialize(&self, user: &str, company: &str) -> Result<SessionState> {
        let profile_path = paths::user_company_doc(user, company);
        let profile = self
            .docs
            .get_doc(&profile_path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("profile {profile_path}")))?;

        let mandate_path = profile
            .get("mandate_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::DocStore(format!("profile {profile_path} has no mandate_path")))?
            .to_string();

        let get_str =
            |k: &str| profile.get(k).and_then(|v| v.as_str()).map(String::from);

        let session = SessionState {
            user_id: user.to_string(),
            company_id: company.to_string(),
            mandate_path,
            country: get_str("country"),
            timezone: get_str("timezone"),
            user_language: get_str("user_language"),
            dms_system: get_str("dms_system"),
            job_metrics: profile.get("job_metrics").cloned().unwrap_or(Value::Null),
            active_threads: BTreeSet::new(),
            created_at: Utc::now(),
        };

        self.write_both(&session).await?;
        tracing::info!(user, company, mandate = %session.mandate_path, "session materialized");
        Ok(session)
    }

    /// Read-through lookup: local cache first, then the store.
    pub async fn get_user_context(&self, user: &str, company: &str) -> Option<SessionState> {
        self.lookup(user, company).await
    }

    async fn lookup(&self, user: &str, company: &str) -> Option<SessionState> {
        if let Some(s) = self
            .local
            .read()
            .get(&(user.to_string(), company.to_string()))
        {
            return Some(s.clone());
        }
        let session = self.read_remote(user, company).await?;
        self.cache_local(session.clone());
        Some(session)
    }

    async fn read_remote(&self, user: &str, company: &str) -> Option<SessionState> {
        let raw = self.store.get(&keys::session_state(user, company)).await?;
        match serde_json::from_str(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(user, company, error = %e, "corrupt session blob ignored");
                None
            }
        }
    }

    fn cache_local(&self, session: SessionState) {
        self.local.write().insert(
            (session.user_id.clone(), session.company_id.clone()),
            session,
        );
    }

    async fn write_both(&self, session: &SessionState) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.store
            .set(
                &keys::session_state(&session.user_id, &session.company_id),
                &raw,
                Some(self.session_ttl_secs),
            )
            .await?;
        self.cache_local(session.clone());
        Ok(())
    }

    /// Merge new job metrics into the session (local + store).
    pub async fn update_job_metrics(
        &self,
        user: &str,
        company: &str,
        metrics: Value,
    ) -> Result<()> {
        let mut session = self
            .lookup(user, company)
            .await
            .ok_or_else(|| Error::NotFound(format!("session {user}:{company}")))?;
        session.job_metrics = metrics;
        self.write_both(&session).await
    }

    /// Record a thread as active on this session.
    pub async fn register_thread(&self, user: &str, company: &str, thread: &str) -> Result<()> {
        let mut session = self
            .lookup(user, company)
            .await
            .ok_or_else(|| Error::NotFound(format!("session {user}:{company}")))?;
        if session.active_threads.insert(thread.to_string()) {
            self.write_both(&session).await?;
        }
        Ok(())
    }

    /// Refresh the sliding TTL.
    pub async fn touch(&self, user: &str, company: &str) {
        let key = keys::session_state(user, company);
        if let Err(e) = self.store.expire(&key, self.session_ttl_secs).await {
            tracing::debug!(key, error = %e, "session TTL refresh failed");
        }
    }

    /// Delete the session everywhere. Returns the thread keys that were
    /// active so the caller can unbind their Brains.
    pub async fn flush(&self, user: &str, company: &str) -> Vec<String> {
        let threads = self
            .lookup(user, company)
            .await
            .map(|s| s.active_threads.into_iter().collect())
            .unwrap_or_default();
        let _ = self.store.del(&keys::session_state(user, company)).await;
        self.local
            .write()
            .remove(&(user.to_string(), company.to_string()));
        threads
    }
}
