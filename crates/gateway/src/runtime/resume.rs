//! Workflow resumption after a worker callback (or a watchdog timeout).
//!
//! The Brain survives a pause in memory; if this instance took over from a
//! dead one, the acquire below rebuilds it from the stores. Either way the
//! thread continues in callback mode with a continuation message that
//! quotes the worker's result.

use ma_domain::task::LptResponse;
use ma_domain::Result;

use crate::state::AppState;

use super::prompts;
use super::turn::{self, PausedWorkflow, WorkflowOutcome};

/// Fire-and-forget resumption; failures are logged, never propagated to
/// the HTTP caller that triggered them.
pub fn spawn_resumption(state: AppState, target: PausedWorkflow, response: LptResponse) {
    tokio::spawn(async move {
        let thread = target.thread_key.clone();
        match resume(&state, &target, &response).await {
            Ok(outcome) => {
                tracing::info!(thread = %thread, outcome = ?outcome, "workflow resumed")
            }
            Err(e) => tracing::error!(thread = %thread, error = %e, "workflow resumption failed"),
        }
    });
}

pub async fn resume(
    state: &AppState,
    target: &PausedWorkflow,
    response: &LptResponse,
) -> Result<WorkflowOutcome> {
    let mut brain = state
        .brains
        .acquire(
            &state.sessions,
            &state.history,
            &target.user_id,
            &target.company_id,
            &target.thread_key,
            None,
            true,
        )
        .await?;

    // A Brain rebuilt on another instance may have lost the task binding
    // if the pause happened before the history flush landed.
    if brain.active_task.is_none() && target.active_task.is_some() {
        brain.active_task = target.active_task.clone();
        brain.history.active_execution = target.active_task.clone();
    }
    brain.enter_callback_mode();

    let continuation = prompts::lpt_continuation(
        &target.expected_lpt,
        response.status,
        &response.summary_text(),
    );
    let handles = turn::prepare_turn(state, &mut brain, &continuation).await?;
    turn::execute(state, &mut brain, handles.assistant_message_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{scripted_state, turn_with_tool, StreamScript};
    use chrono::Utc;
    use ma_domain::chat::Role;
    use ma_domain::task::{LptOutcome, StepStatus};
    use serde_json::json;

    #[tokio::test]
    async fn resume_updates_checklist_then_terminates() {
        // The resumed agent updates the step then terminates, per the
        // callback-mode instruction.
        let (state, _) = scripted_state(vec![
            turn_with_tool(
                "tc_1",
                "UPDATE_STEP",
                json!({"step_id": "step_2", "status": "completed", "message": "42 transactions reconciled"}),
            ),
            turn_with_tool("tc_2", "TERMINATE_TASK", json!({"summary": "mission complete"})),
        ])
        .await;
        let active = state.seed_task_execution("u1", "acme").await;

        let target = PausedWorkflow {
            status: "waiting_lpt".into(),
            expected_lpt: "lpt-000000000001".into(),
            paused_at: Utc::now(),
            user_id: "u1".into(),
            company_id: "acme".into(),
            thread_key: active.task_id.clone(),
            active_task: Some(active.clone()),
            handle: None,
        };
        let response = LptResponse {
            status: LptOutcome::Completed,
            result: Some(json!({"summary": "42 transactions reconciled"})),
            error: None,
        };

        let outcome = resume(&state, &target, &response).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Terminated);

        // The continuation message quoting the worker summary is on the
        // thread, and the report was promoted onto the task.
        let history = state
            .history
            .load("u1", "acme", &active.task_id)
            .await;
        assert!(history
            .messages
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("42 transactions reconciled")));

        let task = crate::runtime::tasks::load_task(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
        )
        .await
        .unwrap();
        let report = task.last_execution_report.unwrap();
        assert_eq!(report.summary, "mission complete");
    }

    #[tokio::test]
    async fn timeout_resume_reaches_agent_as_failure() {
        let (state, _) = scripted_state(vec![turn_with_tool(
            "tc_1",
            "UPDATE_STEP",
            json!({"step_id": "step_1", "status": "error", "message": "worker timed out"}),
        )])
        .await;
        let active = state.seed_task_execution("u1", "acme").await;
        let target = PausedWorkflow {
            status: "waiting_lpt".into(),
            expected_lpt: "lpt-000000000002".into(),
            paused_at: Utc::now(),
            user_id: "u1".into(),
            company_id: "acme".into(),
            thread_key: active.task_id.clone(),
            active_task: Some(active.clone()),
            handle: None,
        };
        let response = LptResponse {
            status: LptOutcome::Failed,
            result: None,
            error: Some("timeout: no worker callback received".into()),
        };
        resume(&state, &target, &response).await.unwrap();

        let exec = crate::runtime::tasks::load_execution(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
            &active.execution_id,
        )
        .await
        .unwrap()
        .unwrap();
        let checklist = exec.workflow_checklist.unwrap();
        assert_eq!(checklist.steps[0].status, StepStatus::Error);
    }
}
