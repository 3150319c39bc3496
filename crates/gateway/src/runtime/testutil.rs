//! Test doubles shared by the runtime tests: a scripted LLM provider, a
//! recording worker client, and a pre-seeded AppState.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::OwnedMutexGuard;

use ma_docstore::{paths, DocumentStore, MemoryDocStore};
use ma_domain::chat::ToolCall;
use ma_domain::config::Config;
use ma_domain::stream::{BoxStream, StreamEvent, Usage};
use ma_domain::task::{
    Checklist, ExecutionPlan, LptEnvelope, Mission, TaskRecord, TaskSchedule, TaskStatus,
};
use ma_domain::Result;
use ma_providers::{ChatRequest, ChatResponse, LlmProvider};
use ma_sessions::history::ActiveExecution;
use ma_sessions::{ChatHistoryManager, SessionStateManager};
use ma_store::{MemoryStore, StateStore};

use crate::state::AppState;
use crate::workers::WorkerSubmitter;

use super::brain::{Brain, BrainCache};
use super::cancel::CancelMap;
use super::presence::PresenceRegistry;
use super::tasks;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted `chat_stream` call.
pub struct StreamScript {
    pub events: Vec<StreamEvent>,
    pub slow: bool,
}

impl StreamScript {
    /// A plain text response streamed as the given tokens.
    pub fn text(parts: &[&str]) -> Self {
        let mut events: Vec<StreamEvent> = parts
            .iter()
            .map(|p| StreamEvent::Token { text: p.to_string() })
            .collect();
        events.push(StreamEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 50,
                completion_tokens: 10,
                total_tokens: 60,
            }),
            finish_reason: Some("stop".into()),
        });
        Self { events, slow: false }
    }

    /// Like [`StreamScript::text`] but with a delay before each event, so
    /// a test can cancel mid-stream.
    pub fn slow_text(parts: &[&str]) -> Self {
        let mut s = Self::text(parts);
        s.slow = true;
        s
    }
}

/// A single-turn script that calls one tool.
pub fn turn_with_tool(call_id: &str, tool_name: &str, arguments: Value) -> StreamScript {
    StreamScript {
        events: vec![
            StreamEvent::ToolCallStarted {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
            },
            StreamEvent::ToolCallFinished {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments,
            },
            StreamEvent::Done {
                usage: Some(Usage {
                    prompt_tokens: 50,
                    completion_tokens: 20,
                    total_tokens: 70,
                }),
                finish_reason: Some("tool_calls".into()),
            },
        ],
        slow: false,
    }
}

pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<StreamScript>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<StreamScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
        // One-shot calls (summarizer, timezone resolver) get a fixed reply.
        Ok(ChatResponse {
            content: "Compressed summary of the earlier conversation.".into(),
            tool_calls: Vec::<ToolCall>::new(),
            usage: Some(Usage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            }),
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        _req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let script = self.scripts.lock().pop_front().unwrap_or(StreamScript {
            events: vec![StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            }],
            slow: false,
        });
        let StreamScript { events, slow } = script;
        Ok(Box::pin(async_stream::stream! {
            for ev in events {
                if slow {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                yield Ok(ev);
            }
        }))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recording worker client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MockWorkers {
    pub submissions: Mutex<Vec<(String, LptEnvelope)>>,
    fail_next: AtomicBool,
}

impl MockWorkers {
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl WorkerSubmitter for MockWorkers {
    async fn submit(&self, tool_name: &str, envelope: &LptEnvelope) -> Result<Value> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ma_domain::Error::Worker {
                worker: tool_name.to_string(),
                message: "scripted submit failure".into(),
            });
        }
        self.submissions
            .lock()
            .push((tool_name.to_string(), envelope.clone()));
        Ok(json!({ "accepted": true }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build an AppState on the in-memory stores with a scripted provider and
/// a profile for ("u1", "acme") on mandate "clients/acme".
pub async fn scripted_state(scripts: Vec<StreamScript>) -> (AppState, Arc<MockWorkers>) {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let docs: Arc<dyn DocumentStore> = Arc::new(MemoryDocStore::new());
    docs.set_doc(
        &paths::user_company_doc("u1", "acme"),
        json!({
            "mandate_path": "clients/acme",
            "country": "CH",
            "timezone": "Europe/Zurich",
            "user_language": "en",
            "job_metrics": {"open_jobs": 2},
        }),
    )
    .await
    .unwrap();
    docs.set_doc(
        &paths::mandate_doc("clients/acme"),
        json!({
            "user_id": "u1",
            "company_id": "acme",
            "country": "CH",
            "timezone": "Europe/Zurich",
        }),
    )
    .await
    .unwrap();

    let config = Arc::new(Config::default());
    let sessions = Arc::new(SessionStateManager::new(
        store.clone(),
        docs.clone(),
        config.sessions.session_ttl_secs,
    ));
    let history = Arc::new(ChatHistoryManager::new(
        store.clone(),
        config.sessions.history_ttl_secs,
    ));
    let workers = Arc::new(MockWorkers::default());

    let state = AppState {
        config,
        store: store.clone(),
        docs,
        llm: Arc::new(ScriptedProvider::new(scripts)),
        workers: workers.clone(),
        sessions,
        history,
        brains: Arc::new(BrainCache::new()),
        presence: Arc::new(PresenceRegistry::new(store)),
        cancel: Arc::new(CancelMap::new()),
        api_token_hash: None,
        callback_token_hash: None,
    };
    (state, workers)
}

impl AppState {
    /// Acquire (and on first use build) the thread's Brain.
    pub(crate) async fn test_brain(
        &self,
        user: &str,
        company: &str,
        thread: &str,
    ) -> OwnedMutexGuard<Brain> {
        self.brains
            .acquire(&self.sessions, &self.history, user, company, thread, None, false)
            .await
            .expect("test brain acquire")
    }

    /// Seed a SCHEDULED task "task-77" with a running execution and a
    /// two-step checklist; returns its binding.
    pub(crate) async fn seed_task_execution(&self, _user: &str, _company: &str) -> ActiveExecution {
        let mandate_path = "clients/acme".to_string();
        let task_id = "task-77".to_string();
        let task = TaskRecord {
            mandate_path: mandate_path.clone(),
            task_id: task_id.clone(),
            execution_plan: ExecutionPlan::Scheduled,
            mission: Mission {
                title: "Monthly reconciliation".into(),
                description: "Reconcile all bank accounts".into(),
                plan: "1. fetch\n2. reconcile".into(),
            },
            schedule: TaskSchedule::default(),
            status: TaskStatus::Active,
            enabled: true,
            execution_count: 0,
            last_execution_report: None,
            created_at: Some(chrono::Utc::now()),
            completed_at: None,
            approval_required: false,
        };
        tasks::save_task(self.docs.as_ref(), &task).await.unwrap();

        let execution_id = tasks::generate_execution_id();
        let mut exec = tasks::create_execution(self.docs.as_ref(), &mandate_path, &task_id, &execution_id)
            .await
            .unwrap();
        exec.workflow_checklist = Some(Checklist::new(&[
            "fetch statements".into(),
            "reconcile accounts".into(),
        ]));
        tasks::save_execution(self.docs.as_ref(), &mandate_path, &task_id, &exec)
            .await
            .unwrap();

        ActiveExecution {
            mandate_path,
            task_id,
            execution_id,
        }
    }
}
