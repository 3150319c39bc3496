//! LPT callback router: `POST /lpt/callback`.
//!
//! Workers echo the original submit envelope with `response` filled in.
//! The router settles the idempotency ledger, mirrors the result onto the
//! checklist, and resumes the paused workflow in callback mode. The same
//! lpt id arriving twice resumes nothing.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use ma_domain::task::LptEnvelope;
use ma_sessions::history::ActiveExecution;
use ma_store::keys;

use crate::runtime::callback_ledger::{self, SettleOutcome};
use crate::runtime::resume;
use crate::runtime::turn::PausedWorkflow;
use crate::state::AppState;

use super::auth;

pub async fn lpt_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<LptEnvelope>,
) -> impl IntoResponse {
    if !auth::bearer_authorized(&headers, &state.callback_token_hash) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "invalid or missing bearer token" })),
        );
    }
    let (status, body) = process(&state, envelope).await;
    (status, Json(body))
}

/// The auth-free core, split out for tests.
pub async fn process(state: &AppState, envelope: LptEnvelope) -> (StatusCode, Value) {
    let Some(response) = envelope.response.clone() else {
        return bad_request("callback carries no response object");
    };
    let thread_key = envelope.traceability.thread_key.clone();
    if thread_key.is_empty() {
        return bad_request("callback carries no traceability.thread_key");
    }
    let lpt_id = envelope.batch_id.clone();
    if lpt_id.is_empty() {
        return bad_request("callback carries no batch id");
    }

    let (user_id, company_id) = match resolve_owner(state, &envelope).await {
        Some(owner) => owner,
        None => return bad_request("callback owner could not be resolved"),
    };
    tracing::info!(
        thread = %thread_key,
        lpt_id = %lpt_id,
        status = ?response.status,
        "LPT callback received"
    );

    // ── Settle the ledger ─────────────────────────────────────────
    let marker_key = keys::workflow_state(&company_id, &thread_key);

    if let Some(execution_id) = envelope.traceability.execution_id.clone() {
        // Task run: the execution's lpt_tasks map is the ledger.
        let active = ActiveExecution {
            mandate_path: envelope.mandates_path.clone(),
            task_id: thread_key.clone(),
            execution_id,
        };
        match callback_ledger::settle(state, &active, &lpt_id, &response).await {
            Ok(SettleOutcome::Recorded) => {}
            Ok(SettleOutcome::Duplicate) | Ok(SettleOutcome::ExecutionGone) => {
                tracing::info!(lpt_id = %lpt_id, "duplicate callback ignored");
                return (StatusCode::OK, json!({ "ok": true, "ignored": "duplicate" }));
            }
            Err(ma_domain::Error::NotFound(e)) => {
                return (
                    StatusCode::NOT_FOUND,
                    json!({ "ok": false, "error": e.to_string() }),
                );
            }
            Err(e) => {
                tracing::error!(lpt_id = %lpt_id, error = %e, "ledger settle failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "ok": false, "error": e.to_string() }),
                );
            }
        }
    } else {
        // Plain chat thread: the pause marker is the ledger.
        match load_marker(state, &marker_key).await {
            Some(marker) if marker.expected_lpt == lpt_id => {}
            Some(marker) => {
                tracing::warn!(
                    lpt_id = %lpt_id,
                    expected = %marker.expected_lpt,
                    "callback for an lpt this thread is not waiting on"
                );
                return (StatusCode::OK, json!({ "ok": true, "ignored": "unexpected_lpt" }));
            }
            None => {
                tracing::info!(lpt_id = %lpt_id, "no paused workflow, duplicate callback ignored");
                return (StatusCode::OK, json!({ "ok": true, "ignored": "duplicate" }));
            }
        }
    }

    // ── Resume ────────────────────────────────────────────────────
    let target = match load_marker(state, &marker_key).await {
        Some(marker) => marker,
        // The marker can be gone (instance died and TTL passed); the
        // envelope carries enough to rebuild the target.
        None => PausedWorkflow {
            status: "waiting_lpt".into(),
            expected_lpt: lpt_id.clone(),
            paused_at: envelope.traceability.initiated_at,
            user_id,
            company_id: company_id.clone(),
            thread_key: thread_key.clone(),
            active_task: envelope.traceability.execution_id.clone().map(|execution_id| {
                ActiveExecution {
                    mandate_path: envelope.mandates_path.clone(),
                    task_id: thread_key.clone(),
                    execution_id,
                }
            }),
            handle: None,
        },
    };
    let _ = state.store.del(&marker_key).await;

    resume::spawn_resumption(state.clone(), target, response);
    (
        StatusCode::OK,
        json!({ "ok": true, "resumed": true, "completed_at": Utc::now() }),
    )
}

fn bad_request(message: &str) -> (StatusCode, Value) {
    (
        StatusCode::BAD_REQUEST,
        json!({ "ok": false, "error": message }),
    )
}

async fn load_marker(state: &AppState, key: &str) -> Option<PausedWorkflow> {
    let raw = state.store.get(key).await?;
    match serde_json::from_str(&raw) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(key, error = %e, "unreadable pause marker");
            None
        }
    }
}

/// Resolve the owning (user, company): mandate document first, then the
/// envelope's `pub_sub_id` channel name (`chat:{user}:{company}:{thread}`).
async fn resolve_owner(state: &AppState, envelope: &LptEnvelope) -> Option<(String, String)> {
    if let Ok(Some(mandate)) = state
        .docs
        .get_doc(&ma_docstore::paths::mandate_doc(&envelope.mandates_path))
        .await
    {
        if let (Some(user), Some(company)) = (
            mandate.get("user_id").and_then(|v| v.as_str()),
            mandate.get("company_id").and_then(|v| v.as_str()),
        ) {
            return Some((user.to_string(), company.to_string()));
        }
    }
    let mut parts = envelope.pub_sub_id.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("chat"), Some(user), Some(company)) => {
            Some((user.to_string(), company.to_string()))
        }
        _ => {
            if envelope.user_id.is_empty() {
                None
            } else {
                tracing::warn!(user = %envelope.user_id, "callback owner company unknown");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{scripted_state, turn_with_tool};
    use crate::runtime::turn::{self, WorkflowOutcome};
    use ma_domain::task::{LptOutcome, LptResponse, StepStatus};
    use serde_json::json;

    /// Drive a task workflow into an LPT pause and return the echoed
    /// envelope a worker would POST back.
    async fn pause_task_on_lpt(
        state: &crate::state::AppState,
        active: &ActiveExecution,
    ) -> LptEnvelope {
        let mut brain = state.test_brain("u1", "acme", &active.task_id).await;
        brain.chat_mode = ma_domain::chat::ChatMode::TaskExecution;
        brain.active_task = Some(active.clone());
        let handles = turn::prepare_turn(state, &mut brain, "run the plan")
            .await
            .unwrap();
        let outcome = turn::execute(state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        drop(brain);
        let lpt_id = match outcome {
            WorkflowOutcome::PausedOnLpt { lpt_id } => lpt_id,
            other => panic!("expected pause, got {other:?}"),
        };

        let exec = crate::runtime::tasks::load_execution(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
            &active.execution_id,
        )
        .await
        .unwrap()
        .unwrap();
        let mut envelope = exec.lpt_tasks[&lpt_id].submit.clone();
        envelope.response = Some(LptResponse {
            status: LptOutcome::Completed,
            result: Some(json!({"summary": "42 transactions reconciled"})),
            error: None,
        });
        envelope.execution_time = Some(17.2);
        envelope.completed_at = Some(Utc::now());
        envelope
    }

    #[tokio::test]
    async fn lpt_round_trip_completes_the_task() {
        let (state, _) = scripted_state(vec![
            // 1st stream: the task run submits the banker job (step_2).
            turn_with_tool(
                "tc_1",
                "LPT_BANKER",
                json!({"jobs_data": [{"account": "CH93"}], "step_id": "step_2"}),
            ),
            // 2nd stream (resumption): update the step then terminate.
            turn_with_tool(
                "tc_2",
                "UPDATE_STEP",
                json!({"step_id": "step_1", "status": "completed", "message": "statements fetched"}),
            ),
            turn_with_tool("tc_3", "TERMINATE_TASK", json!({"summary": "reconciliation done"})),
        ])
        .await;
        let active = state.seed_task_execution("u1", "acme").await;
        let envelope = pause_task_on_lpt(&state, &active).await;

        let (status, body) = process(&state, envelope).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["resumed"], true);

        // The callback mirrored the worker summary onto step_2 before the
        // resumption ran.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let task = crate::runtime::tasks::load_task(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
        )
        .await
        .unwrap();
        let report = task.last_execution_report.expect("task finalized");
        assert_eq!(report.summary, "reconciliation done");
        // Execution record deleted on finalize.
        assert!(crate::runtime::tasks::load_execution(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
            &active.execution_id,
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn duplicate_callback_is_ignored_without_resuming() {
        let (state, _) = scripted_state(vec![
            turn_with_tool(
                "tc_1",
                "LPT_BANKER",
                json!({"jobs_data": [], "step_id": "step_2"}),
            ),
            turn_with_tool("tc_2", "TERMINATE_TASK", json!({"summary": "done"})),
        ])
        .await;
        let active = state.seed_task_execution("u1", "acme").await;
        let envelope = pause_task_on_lpt(&state, &active).await;

        let (first_status, first) = process(&state, envelope.clone()).await;
        assert_eq!(first_status, StatusCode::OK);
        assert_eq!(first["resumed"], true);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let count_before = state
            .history
            .load("u1", "acme", &active.task_id)
            .await
            .messages
            .len();

        let (dup_status, dup) = process(&state, envelope).await;
        assert_eq!(dup_status, StatusCode::OK);
        assert_eq!(dup["ok"], true);
        assert_eq!(dup["ignored"], "duplicate");

        // No new messages appended by the duplicate.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let count_after = state
            .history
            .load("u1", "acme", &active.task_id)
            .await
            .messages
            .len();
        assert_eq!(count_before, count_after);
    }

    #[tokio::test]
    async fn plain_thread_callback_resumes_via_marker() {
        let (state, _) = scripted_state(vec![
            turn_with_tool("tc_1", "LPT_ROUTER", json!({"jobs_data": [{"doc": 1}]})),
            crate::runtime::testutil::StreamScript::text(&["The router finished your batch."]),
        ])
        .await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let handles = turn::prepare_turn(&state, &mut brain, "route my inbox")
            .await
            .unwrap();
        let outcome = turn::execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        drop(brain);
        let lpt_id = match outcome {
            WorkflowOutcome::PausedOnLpt { lpt_id } => lpt_id,
            other => panic!("expected pause, got {other:?}"),
        };

        let marker_key = keys::workflow_state("acme", "t1");
        let marker: PausedWorkflow =
            serde_json::from_str(&state.store.get(&marker_key).await.unwrap()).unwrap();
        let mut envelope = marker.handle.clone().unwrap().submit;
        envelope.response = Some(LptResponse {
            status: LptOutcome::Completed,
            result: Some(json!({"summary": "31 documents routed"})),
            error: None,
        });
        assert_eq!(envelope.batch_id, lpt_id);

        let (status, body) = process(&state, envelope.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resumed"], true);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // Marker consumed; replay is a duplicate.
        assert!(state.store.get(&marker_key).await.is_none());
        let (_, dup) = process(&state, envelope).await;
        assert_eq!(dup["ignored"], "duplicate");

        // The resumed turn quoted the worker summary to the agent.
        let history = state.history.load("u1", "acme", "t1").await;
        assert!(history
            .messages
            .iter()
            .any(|m| m.content.contains("31 documents routed")));
    }

    #[tokio::test]
    async fn malformed_callback_is_rejected() {
        let (state, _) = scripted_state(vec![]).await;
        let active = state.seed_task_execution("u1", "acme").await;
        let envelope = LptEnvelope {
            collection_name: "banker".into(),
            user_id: "u1".into(),
            client_uuid: "c".into(),
            mandates_path: active.mandate_path.clone(),
            batch_id: "lpt-x".into(),
            jobs_data: vec![],
            settings: vec![],
            traceability: ma_domain::task::Traceability {
                thread_key: active.task_id.clone(),
                thread_name: None,
                execution_id: None,
                execution_plan: None,
                initiated_at: Utc::now(),
                source: "worker".into(),
            },
            pub_sub_id: "chat:u1:acme:task-77".into(),
            start_instructions: None,
            response: None, // ← missing
            execution_time: None,
            completed_at: None,
            logs_url: None,
        };
        let (status, body) = process(&state, envelope).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }
}
