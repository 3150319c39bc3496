//! Shared checklist-step update path.
//!
//! Both the agent's `UPDATE_STEP` tool and the LPT callback router land
//! here: load the execution, apply the monotone transition, persist, and
//! mirror the change to the UI channel. Updates are keyed by step id, so
//! repeated writes converge.

use serde_json::json;

use ma_domain::task::{ChecklistStep, StepStatus};
use ma_domain::{Error, Result};
use ma_sessions::history::ActiveExecution;

use crate::state::AppState;

use super::events::{self, ThreadEvent, CMD_UPDATE_STEP_STATUS};
use super::tasks;

pub async fn update_step(
    state: &AppState,
    active: &ActiveExecution,
    channel: &str,
    step_id: &str,
    status: StepStatus,
    message: Option<String>,
) -> Result<ChecklistStep> {
    let mut exec = tasks::load_execution(
        state.docs.as_ref(),
        &active.mandate_path,
        &active.task_id,
        &active.execution_id,
    )
    .await?
    .ok_or_else(|| Error::NotFound(format!("execution {}", active.execution_id)))?;

    let checklist = exec
        .workflow_checklist
        .as_mut()
        .ok_or_else(|| Error::InvalidArgs("no checklist exists for this run".into()))?;

    checklist.apply_update(step_id, status, message, chrono::Utc::now())?;
    let step = checklist
        .steps
        .iter()
        .find(|s| s.id == step_id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("checklist step '{step_id}'")))?;
    let (current, total) = (checklist.current_step, checklist.total_steps);

    tasks::save_execution(state.docs.as_ref(), &active.mandate_path, &active.task_id, &exec)
        .await?;

    events::publish(
        state.store.as_ref(),
        channel,
        &ThreadEvent::WorkflowChecklist {
            command: CMD_UPDATE_STEP_STATUS.into(),
            payload: json!({
                "execution_id": active.execution_id,
                "step": step,
                "current_step": current,
                "total_steps": total,
            }),
        },
    )
    .await;

    Ok(step)
}
