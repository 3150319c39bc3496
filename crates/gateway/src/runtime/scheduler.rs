//! The task scheduler — a leader-elected ticker.
//!
//! Every tick, one instance (whoever wins `lock:cron:tick`) selects the
//! due index entries, spawns a task-execution workflow for each (bounded
//! parallelism), and advances or retires the schedule. A failure to fire
//! one task is logged and leaves its `next_execution_utc` untouched, so
//! the next tick retries it.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;

use ma_docstore::paths;
use ma_domain::task::ExecutionPlan;
use ma_domain::{Error, Result};
use ma_providers::ChatRequest;
use ma_sessions::history::ActiveExecution;
use ma_store::{keys, LockGuard};

use crate::state::AppState;

use super::{cron, prompts, tasks, turn};

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(state.config.scheduler.tick_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_tick(&state).await;
        }
    })
}

/// One scheduler tick. Mutually exclusive across instances via the tick
/// lock; a tick that cannot take the lock is simply somebody else's tick.
pub async fn run_tick(state: &AppState) {
    let Some(lock) = LockGuard::acquire(
        Arc::clone(&state.store),
        keys::cron_tick_lock(),
        state.config.scheduler.lock_ttl_secs,
    )
    .await
    else {
        tracing::debug!("tick lock held elsewhere, skipping");
        return;
    };

    let now = Utc::now();
    match tasks::due_entries(state.docs.as_ref(), now).await {
        Ok(due) => {
            if !due.is_empty() {
                tracing::info!(count = due.len(), "due tasks selected");
            }
            let semaphore = Arc::new(Semaphore::new(state.config.scheduler.max_parallel));
            let mut handles = Vec::new();
            for entry in due {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let st = state.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = fire_task(&st, &entry.mandate_path, &entry.task_id, true).await
                    {
                        tracing::warn!(
                            task_id = %entry.task_id,
                            error = %e,
                            "task fire failed, will retry next tick"
                        );
                    }
                }));
            }
            for h in handles {
                let _ = h.await;
            }
        }
        Err(e) => tracing::warn!(error = %e, "due query failed, tick is a no-op"),
    }

    lock.release().await;
}

/// Fire one task: create its execution, spawn the workflow, and (for
/// scheduler-driven fires) advance or retire the schedule.
///
/// Returns the execution id, or `None` when the task was skipped because
/// it got disabled between selection and execution.
pub async fn fire_task(
    state: &AppState,
    mandate_path: &str,
    task_id: &str,
    from_scheduler: bool,
) -> Result<Option<String>> {
    let mut task = tasks::load_task(state.docs.as_ref(), mandate_path, task_id).await?;
    if from_scheduler && !task.enabled {
        tracing::debug!(task_id, "task disabled after selection, skipping");
        return Ok(None);
    }

    let mandate = state
        .docs
        .get_doc(&paths::mandate_doc(mandate_path))
        .await?
        .ok_or_else(|| Error::NotFound(format!("mandate {mandate_path}")))?;
    let user_id = mandate
        .get("user_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::DocStore(format!("mandate {mandate_path} has no user_id")))?
        .to_string();
    let company_id = mandate
        .get("company_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::DocStore(format!("mandate {mandate_path} has no company_id")))?
        .to_string();

    if task.schedule.timezone.is_none() {
        let tz = resolve_timezone(state, mandate_path, &mandate).await;
        task.schedule.timezone = Some(tz);
    }

    // The thread key equals the task id so history persists across runs.
    let execution_id = tasks::generate_execution_id();
    tasks::create_execution(state.docs.as_ref(), mandate_path, task_id, &execution_id).await?;

    // Make sure the durable thread exists; an existing one is kept as-is.
    let thread_path = paths::thread_doc(&company_id, task_id);
    if state.docs.get_doc(&thread_path).await?.is_none() {
        state
            .docs
            .set_doc(
                &thread_path,
                serde_json::json!({
                    "thread_key": task_id,
                    "kind": "task",
                    "title": task.mission.title,
                    "created_at": Utc::now(),
                }),
            )
            .await?;
    }

    state.sessions.ensure(&user_id, &company_id).await?;

    // ── Spawn the workflow ────────────────────────────────────────
    {
        let st = state.clone();
        let active = ActiveExecution {
            mandate_path: mandate_path.to_string(),
            task_id: task_id.to_string(),
            execution_id: execution_id.clone(),
        };
        let mission = task.mission.clone();
        let last_report = task.last_execution_report.clone();
        let mission_text = format!(
            "Execute this task now.\n\n{}\n{}\n\nPlan:\n{}",
            mission.title, mission.description, mission.plan
        );
        let (user_id, company_id, thread) = (user_id.clone(), company_id, task_id.to_string());
        tokio::spawn(async move {
            let brain = st
                .brains
                .acquire(&st.sessions, &st.history, &user_id, &company_id, &thread, None, true)
                .await;
            let mut brain = match brain {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(thread = %thread, error = %e, "task brain acquire failed");
                    return;
                }
            };
            brain.bind_task(active, &mission, last_report.as_ref());
            let run = async {
                let handles = turn::prepare_turn(&st, &mut brain, &mission_text).await?;
                turn::execute(&st, &mut brain, handles.assistant_message_id).await
            };
            match run.await {
                Ok(outcome) => tracing::info!(thread = %thread, outcome = ?outcome, "task workflow finished"),
                Err(e) => tracing::error!(thread = %thread, error = %e, "task workflow failed"),
            }
        });
    }

    // ── Advance / retire the schedule ─────────────────────────────
    if from_scheduler {
        match task.execution_plan {
            ExecutionPlan::Scheduled => {
                let trigger = task.schedule.next_execution_utc.unwrap_or(Utc::now());
                let after = trigger.max(Utc::now());
                let (next_utc, next_local) = cron::schedule_next(&task.schedule, &after)?;
                task.schedule.next_execution_utc = Some(next_utc);
                task.schedule.next_execution_local_time = Some(next_local);
                task.execution_count += 1;
                tasks::save_task(state.docs.as_ref(), &task).await?;
                tasks::sync_index_entry(state.docs.as_ref(), &task).await?;
            }
            ExecutionPlan::OneTime => {
                // Deselect immediately; the enabled/status flip waits for
                // finalization so the task cannot get lost.
                tasks::remove_index_entry(state.docs.as_ref(), mandate_path, task_id).await?;
                tasks::save_task(state.docs.as_ref(), &task).await?;
            }
            _ => {}
        }
    } else if task.schedule.timezone.is_some() {
        // Persist a timezone resolved during an on-demand fire.
        tasks::save_task(state.docs.as_ref(), &task).await?;
    }

    Ok(Some(execution_id))
}

/// Resolve the mandate's timezone, asking the model once if it was never
/// set, and persist the answer so it is resolved exactly once per mandate.
async fn resolve_timezone(
    state: &AppState,
    mandate_path: &str,
    mandate: &serde_json::Value,
) -> String {
    if let Some(tz) = mandate
        .get("timezone")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
    {
        return tz.to_string();
    }

    let country = mandate
        .get("country")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let answer = state
        .llm
        .chat(ChatRequest {
            messages: vec![ma_domain::chat::Message::user(prompts::timezone_question(
                country,
            ))],
            tools: Vec::new(),
            temperature: Some(0.0),
            max_tokens: Some(64),
            model: None,
        })
        .await;

    let tz = match answer {
        Ok(resp) => {
            let candidate = resp.content.trim().to_string();
            if candidate.parse::<chrono_tz::Tz>().is_ok() {
                candidate
            } else {
                tracing::warn!(country, candidate, "unusable timezone answer, falling back to UTC");
                "UTC".to_string()
            }
        }
        Err(e) => {
            tracing::warn!(country, error = %e, "timezone resolution failed, falling back to UTC");
            "UTC".to_string()
        }
    };

    if let Err(e) = state
        .docs
        .update_doc(
            &paths::mandate_doc(mandate_path),
            serde_json::json!({ "timezone": tz }),
        )
        .await
    {
        tracing::warn!(mandate_path, error = %e, "timezone persist failed");
    }
    tz
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{scripted_state, turn_with_tool, StreamScript};
    use chrono::{Duration, TimeZone};
    use ma_domain::task::{
        Frequency, Mission, TaskRecord, TaskSchedule, TaskStatus,
    };
    use serde_json::json;

    async fn seed_scheduled_task(state: &crate::state::AppState, next_utc: chrono::DateTime<Utc>) {
        let task = TaskRecord {
            mandate_path: "clients/acme".into(),
            task_id: "task-daily".into(),
            execution_plan: ExecutionPlan::Scheduled,
            mission: Mission {
                title: "Daily reconciliation".into(),
                description: "Reconcile yesterday's statements".into(),
                plan: "1. fetch\n2. reconcile".into(),
            },
            schedule: TaskSchedule {
                cron: "0 3 * * *".into(),
                frequency: Some(Frequency::Daily),
                time: Some("03:00".into()),
                timezone: Some("Europe/Zurich".into()),
                next_execution_utc: Some(next_utc),
                next_execution_local_time: None,
                ..Default::default()
            },
            status: TaskStatus::Active,
            enabled: true,
            execution_count: 3,
            last_execution_report: None,
            created_at: Some(Utc::now()),
            completed_at: None,
            approval_required: false,
        };
        tasks::save_task(state.docs.as_ref(), &task).await.unwrap();
        tasks::sync_index_entry(state.docs.as_ref(), &task).await.unwrap();
    }

    #[tokio::test]
    async fn tick_fires_due_task_and_advances_schedule() {
        // The spawned workflow immediately terminates.
        let (state, _) = scripted_state(vec![turn_with_tool(
            "tc_1",
            "TERMINATE_TASK",
            json!({"summary": "ran"}),
        )])
        .await;
        // Due: 2025-12-02 03:00 Zurich == 02:00 UTC, and "now" is after it.
        let trigger = Utc.with_ymd_and_hms(2025, 12, 2, 2, 0, 0).unwrap();
        seed_scheduled_task(&state, trigger).await;

        // Fire directly (run_tick would use wall-clock "now").
        let exec_id = fire_task(&state, "clients/acme", "task-daily", true)
            .await
            .unwrap()
            .expect("fired");
        assert_eq!(exec_id.len(), 12);

        let task = tasks::load_task(state.docs.as_ref(), "clients/acme", "task-daily")
            .await
            .unwrap();
        assert_eq!(task.execution_count, 4);
        let next = task.schedule.next_execution_utc.unwrap();
        assert!(next > trigger, "next execution strictly after the trigger");
        // 03:00 Zurich winter == 02:00 UTC next day (or later if the wall
        // clock has moved past it, still strictly in the future).
        assert!(next > Utc::now() || next == Utc.with_ymd_and_hms(2025, 12, 3, 2, 0, 0).unwrap());

        // Give the spawned workflow a beat; its execution record must be
        // created with thread_key == task_id.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let history = state.history.load("u1", "acme", "task-daily").await;
        assert!(!history.messages.is_empty(), "mission message appended");
    }

    #[tokio::test]
    async fn disabled_between_selection_and_execution_is_skipped() {
        let (state, _) = scripted_state(vec![]).await;
        let trigger = Utc::now() - Duration::minutes(5);
        seed_scheduled_task(&state, trigger).await;

        let mut task = tasks::load_task(state.docs.as_ref(), "clients/acme", "task-daily")
            .await
            .unwrap();
        task.enabled = false;
        tasks::save_task(state.docs.as_ref(), &task).await.unwrap();

        let fired = fire_task(&state, "clients/acme", "task-daily", true)
            .await
            .unwrap();
        assert!(fired.is_none());
    }

    #[tokio::test]
    async fn one_time_fire_removes_index_but_keeps_enabled() {
        let (state, _) = scripted_state(vec![StreamScript::text(&["working"])]).await;
        let record = TaskRecord {
            mandate_path: "clients/acme".into(),
            task_id: "task-once".into(),
            execution_plan: ExecutionPlan::OneTime,
            mission: Mission {
                title: "Initial import".into(),
                description: "Import opening balances".into(),
                plan: String::new(),
            },
            schedule: TaskSchedule {
                timezone: Some("UTC".into()),
                next_execution_utc: Some(Utc::now() - Duration::minutes(1)),
                ..Default::default()
            },
            status: TaskStatus::Active,
            enabled: true,
            execution_count: 0,
            last_execution_report: None,
            created_at: Some(Utc::now()),
            completed_at: None,
            approval_required: false,
        };
        tasks::save_task(state.docs.as_ref(), &record).await.unwrap();
        tasks::sync_index_entry(state.docs.as_ref(), &record).await.unwrap();

        fire_task(&state, "clients/acme", "task-once", true)
            .await
            .unwrap()
            .expect("fired");

        // Index entry gone (no refire), but the task stays enabled until
        // finalization writes the report.
        assert!(tasks::due_entries(state.docs.as_ref(), Utc::now() + Duration::days(1))
            .await
            .unwrap()
            .is_empty());
        let reloaded = tasks::load_task(state.docs.as_ref(), "clients/acme", "task-once")
            .await
            .unwrap();
        assert!(reloaded.enabled);
    }

    #[tokio::test]
    async fn tick_lock_is_exclusive() {
        let (state, _) = scripted_state(vec![]).await;
        // Hold the tick lock as "another instance".
        let held = LockGuard::acquire(
            Arc::clone(&state.store),
            keys::cron_tick_lock(),
            300,
        )
        .await
        .unwrap();

        let trigger = Utc::now() - Duration::minutes(5);
        seed_scheduled_task(&state, trigger).await;
        run_tick(&state).await;

        // Nothing fired: execution_count unchanged.
        let task = tasks::load_task(state.docs.as_ref(), "clients/acme", "task-daily")
            .await
            .unwrap();
        assert_eq!(task.execution_count, 3);
        held.release().await;
    }

    #[tokio::test]
    async fn missing_timezone_is_resolved_once_and_persisted() {
        let (state, _) = scripted_state(vec![StreamScript::text(&["ok"])]).await;
        state
            .docs
            .update_doc("clients/acme", json!({"timezone": ""}))
            .await
            .unwrap();
        let mandate = state.docs.get_doc("clients/acme").await.unwrap().unwrap();
        // The scripted provider answers with prose, so the resolver falls
        // back to UTC and persists it.
        let tz = resolve_timezone(&state, "clients/acme", &mandate).await;
        assert_eq!(tz, "UTC");
        let mandate = state.docs.get_doc("clients/acme").await.unwrap().unwrap();
        assert_eq!(mandate["timezone"], "UTC");

        // Second call short-circuits on the persisted value.
        let tz2 = resolve_timezone(&state, "clients/acme", &mandate).await;
        assert_eq!(tz2, "UTC");
    }
}
