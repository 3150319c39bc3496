//! Watchdog for lost worker callbacks.
//!
//! Workers normally close the loop through `POST /lpt/callback`; when one
//! never does, the paused workflow would wait forever. The watchdog sweeps
//! the `workflow_state:*` markers and force-resumes anything paused past
//! the deadline with a synthetic failure, so the agent can take corrective
//! action.

use chrono::{Duration, Utc};

use ma_domain::task::{LptOutcome, LptResponse};
use ma_store::keys;

use crate::state::AppState;

use super::resume;
use super::turn::PausedWorkflow;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(state.config.watchdog.sweep_secs);
        loop {
            tokio::time::sleep(period).await;
            run_sweep(&state).await;
        }
    })
}

pub async fn run_sweep(state: &AppState) {
    let deadline = Duration::seconds(state.config.watchdog.max_lpt_wait_secs as i64);
    let now = Utc::now();

    for key in state.store.scan(&keys::workflow_state_pattern()).await {
        let Some(raw) = state.store.get(&key).await else {
            continue;
        };
        let marker: PausedWorkflow = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(key, error = %e, "unreadable pause marker, removing");
                let _ = state.store.del(&key).await;
                continue;
            }
        };
        if marker.paused_at + deadline >= now {
            continue;
        }

        // Claim the timeout so concurrent sweepers resume at most once.
        let claim_key = format!("{key}:timeout_claim");
        if !state.store.setnx(&claim_key, "1", 600).await {
            continue;
        }
        let _ = state.store.del(&key).await;

        tracing::warn!(
            thread = %marker.thread_key,
            lpt_id = %marker.expected_lpt,
            paused_at = %marker.paused_at,
            "LPT callback never arrived, forcing failed resumption"
        );

        let response = LptResponse {
            status: LptOutcome::Failed,
            result: None,
            error: Some("timeout: no worker callback received".into()),
        };

        // Settle the ledger so a late real callback is a duplicate.
        if let Some(active) = &marker.active_task {
            if let Err(e) = super::callback_ledger::settle(
                state,
                active,
                &marker.expected_lpt,
                &response,
            )
            .await
            {
                tracing::debug!(lpt_id = %marker.expected_lpt, error = %e, "timeout ledger settle skipped");
            }
        }

        resume::spawn_resumption(state.clone(), marker, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{scripted_state, turn_with_tool};
    use serde_json::json;

    #[tokio::test]
    async fn expired_pause_is_resumed_with_timeout_failure() {
        let (state, _) = scripted_state(vec![turn_with_tool(
            "tc_1",
            "TERMINATE_TASK",
            json!({"summary": "aborted after timeout"}),
        )])
        .await;
        let active = state.seed_task_execution("u1", "acme").await;

        let marker = PausedWorkflow {
            status: "waiting_lpt".into(),
            expected_lpt: "lpt-timeout00001".into(),
            paused_at: Utc::now() - Duration::hours(3),
            user_id: "u1".into(),
            company_id: "acme".into(),
            thread_key: active.task_id.clone(),
            active_task: Some(active.clone()),
            handle: None,
        };
        let key = keys::workflow_state("acme", &active.task_id);
        state
            .store
            .set(&key, &serde_json::to_string(&marker).unwrap(), None)
            .await
            .unwrap();

        run_sweep(&state).await;
        // Marker claimed and removed.
        assert!(state.store.get(&key).await.is_none());

        // The spawned resumption terminates the task.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let task = crate::runtime::tasks::load_task(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
        )
        .await
        .unwrap();
        assert_eq!(
            task.last_execution_report.unwrap().summary,
            "aborted after timeout"
        );
    }

    #[tokio::test]
    async fn fresh_pause_is_left_alone() {
        let (state, _) = scripted_state(vec![]).await;
        let marker = PausedWorkflow {
            status: "waiting_lpt".into(),
            expected_lpt: "lpt-fresh0000001".into(),
            paused_at: Utc::now(),
            user_id: "u1".into(),
            company_id: "acme".into(),
            thread_key: "t1".into(),
            active_task: None,
            handle: None,
        };
        let key = keys::workflow_state("acme", "t1");
        state
            .store
            .set(&key, &serde_json::to_string(&marker).unwrap(), None)
            .await
            .unwrap();
        run_sweep(&state).await;
        assert!(state.store.get(&key).await.is_some());
    }
}
