//! Task and execution persistence, the scheduler index, and run
//! finalization.
//!
//! The index under `scheduled_tasks/` mirrors just enough of each active
//! SCHEDULED / ONE_TIME task for the scheduler's due query; the task
//! document stays the source of truth.

use chrono::Utc;
use rand::Rng;

use ma_docstore::{paths, DocumentStore};
use ma_domain::task::{
    ExecutionPlan, ExecutionRecord, ExecutionReport, ExecutionStatus, IndexEntry, TaskRecord,
    TaskStatus,
};
use ma_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task documents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn load_task(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
) -> Result<TaskRecord> {
    let path = paths::task_doc(mandate_path, task_id);
    let doc = docs
        .get_doc(&path)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task {path}")))?;
    serde_json::from_value(doc).map_err(|e| Error::DocStore(format!("task {path}: {e}")))
}

pub async fn save_task(docs: &dyn DocumentStore, task: &TaskRecord) -> Result<()> {
    let path = paths::task_doc(&task.mandate_path, &task.task_id);
    docs.set_doc(&path, serde_json::to_value(task)?).await
}

pub async fn list_tasks(docs: &dyn DocumentStore, mandate_path: &str) -> Result<Vec<TaskRecord>> {
    let raw = docs.list_docs(&paths::tasks_collection(mandate_path)).await?;
    Ok(raw
        .into_iter()
        .filter_map(|(id, doc)| match serde_json::from_value(doc) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "skipping unreadable task doc");
                None
            }
        })
        .collect())
}

/// Delete the task and its index entry.
pub async fn delete_task(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
) -> Result<()> {
    docs.delete_doc(&paths::task_doc(mandate_path, task_id)).await?;
    docs.delete_doc(&paths::index_doc(mandate_path, task_id)).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Write (or refresh) the task's index entry. Only enabled SCHEDULED and
/// ONE_TIME tasks with a computed next execution are indexed; anything
/// else clears the entry.
pub async fn sync_index_entry(docs: &dyn DocumentStore, task: &TaskRecord) -> Result<()> {
    let indexable = task.enabled
        && matches!(
            task.execution_plan,
            ExecutionPlan::Scheduled | ExecutionPlan::OneTime
        )
        && task.schedule.next_execution_utc.is_some();

    let path = paths::index_doc(&task.mandate_path, &task.task_id);
    if !indexable {
        return docs.delete_doc(&path).await;
    }
    let entry = IndexEntry {
        mandate_path: task.mandate_path.clone(),
        task_id: task.task_id.clone(),
        enabled: task.enabled,
        next_execution_utc: task.schedule.next_execution_utc.unwrap(),
    };
    docs.set_doc(&path, serde_json::to_value(&entry)?).await
}

pub async fn remove_index_entry(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
) -> Result<()> {
    docs.delete_doc(&paths::index_doc(mandate_path, task_id)).await
}

/// All index entries due at `now`, soonest first.
pub async fn due_entries(
    docs: &dyn DocumentStore,
    now: chrono::DateTime<Utc>,
) -> Result<Vec<IndexEntry>> {
    let raw = docs.list_docs(paths::SCHEDULER_INDEX).await?;
    let mut due: Vec<IndexEntry> = raw
        .into_iter()
        .filter_map(|(id, doc)| match serde_json::from_value::<IndexEntry>(doc) {
            Ok(e) => Some(e),
            Err(err) => {
                tracing::warn!(entry = %id, error = %err, "skipping unreadable index entry");
                None
            }
        })
        .filter(|e| e.enabled && e.next_execution_utc <= now)
        .collect();
    due.sort_by_key(|e| e.next_execution_utc);
    Ok(due)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Random 12-hex execution id.
pub fn generate_execution_id() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| format!("{:x}", rng.gen_range(0..16)))
        .collect()
}

pub async fn create_execution(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
    execution_id: &str,
) -> Result<ExecutionRecord> {
    // Task history persists across runs: the thread key is the task id.
    let exec = ExecutionRecord::new(execution_id.to_string(), task_id.to_string(), Utc::now());
    save_execution(docs, mandate_path, task_id, &exec).await?;
    Ok(exec)
}

pub async fn load_execution(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
    execution_id: &str,
) -> Result<Option<ExecutionRecord>> {
    let path = paths::execution_doc(mandate_path, task_id, execution_id);
    match docs.get_doc(&path).await? {
        Some(doc) => Ok(Some(
            serde_json::from_value(doc)
                .map_err(|e| Error::DocStore(format!("execution {path}: {e}")))?,
        )),
        None => Ok(None),
    }
}

pub async fn save_execution(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
    exec: &ExecutionRecord,
) -> Result<()> {
    let path = paths::execution_doc(mandate_path, task_id, &exec.execution_id);
    docs.set_doc(&path, serde_json::to_value(exec)?).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Close out a finished run: classify it from the checklist, promote the
/// report onto the parent task, retire ONE_TIME tasks, and delete the
/// execution record.
///
/// The task update happens before the execution delete; if the update
/// fails the execution stays in place so a later sweep can retry, and a
/// ONE_TIME task keeps its enabled flag until the report landed.
pub async fn finalize_execution(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
    execution_id: &str,
    summary: String,
) -> Result<ExecutionReport> {
    let exec = load_execution(docs, mandate_path, task_id, execution_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;

    let (status, total, completed, errored) = match &exec.workflow_checklist {
        Some(cl) => (
            cl.classify(),
            cl.total_steps,
            cl.completed_count(),
            cl.errored_count(),
        ),
        // No checklist was ever created; trust the agent's terminate.
        None => (ExecutionStatus::Completed, 0, 0, 0),
    };

    let report = ExecutionReport {
        execution_id: execution_id.to_string(),
        status,
        summary,
        steps_total: total,
        steps_completed: completed,
        steps_errored: errored,
        finished_at: Utc::now(),
    };

    let mut task = load_task(docs, mandate_path, task_id).await?;
    task.last_execution_report = Some(report.clone());
    if task.execution_plan == ExecutionPlan::OneTime {
        task.enabled = false;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(report.finished_at);
    }
    save_task(docs, &task).await?;

    docs.delete_doc(&paths::execution_doc(mandate_path, task_id, execution_id))
        .await?;
    tracing::info!(task_id, execution_id, status = ?report.status, "execution finalized");
    Ok(report)
}

/// Record an LPT handle on its execution (submit side).
pub async fn attach_lpt_handle(
    docs: &dyn DocumentStore,
    mandate_path: &str,
    task_id: &str,
    execution_id: &str,
    handle: ma_domain::task::LptHandle,
) -> Result<()> {
    let mut exec = load_execution(docs, mandate_path, task_id, execution_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;
    exec.lpt_tasks.insert(handle.lpt_id.clone(), handle);
    save_execution(docs, mandate_path, task_id, &exec).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ma_docstore::MemoryDocStore;
    use ma_domain::task::{Checklist, Mission, StepStatus, TaskSchedule};

    fn task(plan: ExecutionPlan) -> TaskRecord {
        TaskRecord {
            mandate_path: "clients/acme".into(),
            task_id: "t1".into(),
            execution_plan: plan,
            mission: Mission {
                title: "Reconcile".into(),
                description: "Reconcile the bank".into(),
                plan: "1. fetch\n2. match".into(),
            },
            schedule: TaskSchedule {
                next_execution_utc: Some(Utc.with_ymd_and_hms(2025, 12, 2, 2, 0, 0).unwrap()),
                ..Default::default()
            },
            status: TaskStatus::Active,
            enabled: true,
            execution_count: 0,
            last_execution_report: None,
            created_at: Some(Utc::now()),
            completed_at: None,
            approval_required: false,
        }
    }

    #[test]
    fn execution_ids_are_12_hex() {
        for _ in 0..20 {
            let id = generate_execution_id();
            assert_eq!(id.len(), 12);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let docs = MemoryDocStore::new();
        let t = task(ExecutionPlan::Scheduled);
        save_task(&docs, &t).await.unwrap();
        let loaded = load_task(&docs, "clients/acme", "t1").await.unwrap();
        assert_eq!(loaded.mission.title, "Reconcile");
    }

    #[tokio::test]
    async fn index_sync_and_due_query() {
        let docs = MemoryDocStore::new();
        let t = task(ExecutionPlan::Scheduled);
        save_task(&docs, &t).await.unwrap();
        sync_index_entry(&docs, &t).await.unwrap();

        let now = t.schedule.next_execution_utc.unwrap() + Duration::minutes(1);
        let due = due_entries(&docs, now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, "t1");

        // Not due yet before the trigger time.
        let early = t.schedule.next_execution_utc.unwrap() - Duration::minutes(1);
        assert!(due_entries(&docs, early).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_task_loses_its_index_entry() {
        let docs = MemoryDocStore::new();
        let mut t = task(ExecutionPlan::Scheduled);
        save_task(&docs, &t).await.unwrap();
        sync_index_entry(&docs, &t).await.unwrap();

        t.enabled = false;
        sync_index_entry(&docs, &t).await.unwrap();
        let now = t.schedule.next_execution_utc.unwrap() + Duration::days(1);
        assert!(due_entries(&docs, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_demand_tasks_are_never_indexed() {
        let docs = MemoryDocStore::new();
        let t = task(ExecutionPlan::OnDemand);
        save_task(&docs, &t).await.unwrap();
        sync_index_entry(&docs, &t).await.unwrap();
        let now = Utc::now() + Duration::days(365);
        assert!(due_entries(&docs, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn execution_thread_key_equals_task_id() {
        let docs = MemoryDocStore::new();
        let exec = create_execution(&docs, "clients/acme", "t1", "abcdefabcdef")
            .await
            .unwrap();
        assert_eq!(exec.thread_key, "t1");
        assert_eq!(exec.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn finalize_promotes_report_and_deletes_execution() {
        let docs = MemoryDocStore::new();
        let t = task(ExecutionPlan::Scheduled);
        save_task(&docs, &t).await.unwrap();
        let mut exec = create_execution(&docs, "clients/acme", "t1", "e00000000001")
            .await
            .unwrap();

        let mut cl = Checklist::new(&["fetch".into(), "match".into()]);
        cl.apply_update("step_1", StepStatus::Completed, None, Utc::now())
            .unwrap();
        cl.apply_update("step_2", StepStatus::Completed, None, Utc::now())
            .unwrap();
        exec.workflow_checklist = Some(cl);
        save_execution(&docs, "clients/acme", "t1", &exec).await.unwrap();

        let report = finalize_execution(&docs, "clients/acme", "t1", "e00000000001", "all done".into())
            .await
            .unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);

        let reloaded = load_task(&docs, "clients/acme", "t1").await.unwrap();
        assert_eq!(
            reloaded.last_execution_report.as_ref().unwrap().summary,
            "all done"
        );
        // The execution record is gone.
        assert!(load_execution(&docs, "clients/acme", "t1", "e00000000001")
            .await
            .unwrap()
            .is_none());
        // SCHEDULED tasks stay enabled.
        assert!(reloaded.enabled);
    }

    #[tokio::test]
    async fn finalize_retires_one_time_task() {
        let docs = MemoryDocStore::new();
        let t = task(ExecutionPlan::OneTime);
        save_task(&docs, &t).await.unwrap();
        create_execution(&docs, "clients/acme", "t1", "e00000000002")
            .await
            .unwrap();

        finalize_execution(&docs, "clients/acme", "t1", "e00000000002", "done".into())
            .await
            .unwrap();
        let reloaded = load_task(&docs, "clients/acme", "t1").await.unwrap();
        assert!(!reloaded.enabled);
        assert_eq!(reloaded.status, TaskStatus::Completed);
        assert!(reloaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn attach_handle_lands_in_lpt_tasks() {
        use ma_domain::task::{LptEnvelope, LptHandle, Traceability};
        let docs = MemoryDocStore::new();
        create_execution(&docs, "clients/acme", "t1", "e00000000003")
            .await
            .unwrap();
        let handle = LptHandle {
            lpt_id: "b-1".into(),
            task_type: "LPT_BANKER".into(),
            status: "submitted".into(),
            created_at: Utc::now(),
            step_id: Some("step_2".into()),
            submit: LptEnvelope {
                collection_name: "bank_jobs".into(),
                user_id: "u1".into(),
                client_uuid: "c".into(),
                mandates_path: "clients/acme".into(),
                batch_id: "b-1".into(),
                jobs_data: vec![],
                settings: vec![],
                traceability: Traceability {
                    thread_key: "t1".into(),
                    thread_name: None,
                    execution_id: Some("e00000000003".into()),
                    execution_plan: None,
                    initiated_at: Utc::now(),
                    source: "maestro".into(),
                },
                pub_sub_id: "chat:u1:acme:t1".into(),
                start_instructions: None,
                response: None,
                execution_time: None,
                completed_at: None,
                logs_url: None,
            },
            response: None,
        };
        attach_lpt_handle(&docs, "clients/acme", "t1", "e00000000003", handle)
            .await
            .unwrap();
        let exec = load_execution(&docs, "clients/acme", "t1", "e00000000003")
            .await
            .unwrap()
            .unwrap();
        assert!(exec.lpt_tasks.contains_key("b-1"));
        assert!(!exec.lpt_tasks["b-1"].is_settled());
    }
}
