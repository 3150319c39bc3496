//! The callback idempotency ledger for task executions.
//!
//! `lpt_tasks[lpt_id].response` on the execution record is the authority
//! on whether a terminal result was already honored. Settling records the
//! response and moves the linked checklist step; a second settle for the
//! same lpt id reports a duplicate and changes nothing.

use ma_domain::task::{LptOutcome, LptResponse, StepStatus};
use ma_domain::{Error, Result};
use ma_sessions::history::ActiveExecution;

use crate::state::AppState;

use super::{checklist, tasks};

#[derive(Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    /// First terminal response for this lpt id; ledger updated.
    Recorded,
    /// This lpt id already carries a terminal response.
    Duplicate,
    /// The execution record no longer exists (already finalized).
    ExecutionGone,
}

pub async fn settle(
    state: &AppState,
    active: &ActiveExecution,
    lpt_id: &str,
    response: &LptResponse,
) -> Result<SettleOutcome> {
    let Some(mut exec) = tasks::load_execution(
        state.docs.as_ref(),
        &active.mandate_path,
        &active.task_id,
        &active.execution_id,
    )
    .await?
    else {
        return Ok(SettleOutcome::ExecutionGone);
    };

    let handle = exec
        .lpt_tasks
        .get_mut(lpt_id)
        .ok_or_else(|| Error::NotFound(format!("lpt {lpt_id} on execution {}", active.execution_id)))?;
    if handle.is_settled() {
        return Ok(SettleOutcome::Duplicate);
    }
    handle.response = Some(response.clone());
    handle.status = "settled".into();
    let step_id = handle.step_id.clone();

    tasks::save_execution(state.docs.as_ref(), &active.mandate_path, &active.task_id, &exec)
        .await?;

    // Mirror the result onto the linked checklist step.
    if let Some(step_id) = step_id {
        let status = match response.status {
            LptOutcome::Completed | LptOutcome::Partial => StepStatus::Completed,
            LptOutcome::Failed => StepStatus::Error,
        };
        let channel = channel_for(state, active).await;
        if let Err(e) = checklist::update_step(
            state,
            active,
            &channel,
            &step_id,
            status,
            Some(response.summary_text()),
        )
        .await
        {
            tracing::warn!(lpt_id, step_id = %step_id, error = %e, "checklist mirror of callback failed");
        }
    }

    Ok(SettleOutcome::Recorded)
}

/// Thread channel for a task execution. The owning user/company come from
/// the mandate document.
async fn channel_for(state: &AppState, active: &ActiveExecution) -> String {
    let mandate = state
        .docs
        .get_doc(&ma_docstore::paths::mandate_doc(&active.mandate_path))
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    let user = mandate
        .get("user_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let company = mandate
        .get("company_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    ma_store::keys::chat_channel(user, company, &active.task_id)
}
