//! Tool registry for the runtime — declares the tool definitions bound to
//! each chat mode and dispatches tool calls.
//!
//! Two kinds of tool:
//! - **short-process**: handled inline, result returned within the turn;
//! - **long-process** (`LPT_*`): submitted to a worker over HTTP; the
//!   workflow pauses until the worker calls back.

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use ma_docstore::paths;
use ma_domain::chat::{ChatMode, ToolDefinition};
use ma_domain::task::{
    ExecutionPlan, Checklist, LptEnvelope, LptHandle, Mission, StepStatus, TaskRecord,
    TaskSchedule, TaskStatus, Traceability,
};

use crate::state::AppState;

use super::brain::Brain;
use super::events::{self, ThreadEvent, CMD_CREATE_CHECKLIST};
use super::{cron, tasks};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the executor does after a tool ran.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolControl {
    /// Keep looping.
    Continue,
    /// An LPT was submitted; park the workflow until the callback.
    PausedOnLpt { lpt_id: String, handle: Box<LptHandle> },
    /// TERMINATE_TASK was called.
    Terminate { summary: String },
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub content: String,
    pub is_error: bool,
    pub control: ToolControl,
}

impl DispatchResult {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            control: ToolControl::Continue,
        }
    }

    fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            control: ToolControl::Continue,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn obj_schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

fn full_suite() -> Vec<ToolDefinition> {
    let mut defs = vec![
        ToolDefinition {
            name: "GET_COMPANY_PROFILE".into(),
            description: "Read the mandate profile bound to this conversation: identifiers, country, timezone, language, DMS system.".into(),
            parameters: obj_schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "GET_JOB_STATUS".into(),
            description: "Read the current job metrics snapshot for this mandate (open jobs, queues, backlog counts).".into(),
            parameters: obj_schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "UPDATE_JOB_METRICS".into(),
            description: "Replace the job metrics snapshot on the session.".into(),
            parameters: obj_schema(
                json!({ "metrics": { "type": "object", "description": "New metrics object" } }),
                &["metrics"],
            ),
        },
        ToolDefinition {
            name: "LIST_TASKS".into(),
            description: "List the agent tasks configured on this mandate with their schedules and last reports.".into(),
            parameters: obj_schema(json!({}), &[]),
        },
        ToolDefinition {
            name: "CREATE_TASK".into(),
            description: "Create an agent task on this mandate. SCHEDULED tasks need frequency (daily/weekly/monthly) and time (HH:MM).".into(),
            parameters: obj_schema(
                json!({
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "plan": { "type": "string", "description": "Step-by-step plan text" },
                    "execution_plan": { "type": "string", "enum": ["SCHEDULED", "ONE_TIME", "ON_DEMAND"] },
                    "frequency": { "type": "string", "enum": ["daily", "weekly", "monthly"] },
                    "time": { "type": "string", "description": "HH:MM in the mandate timezone" },
                    "day_of_week": { "type": "integer", "description": "0=Sunday..6=Saturday" },
                    "day_of_month": { "type": "integer" }
                }),
                &["title", "description", "execution_plan"],
            ),
        },
        ToolDefinition {
            name: "TERMINATE_TASK".into(),
            description: "Finish the current work. Inside a task run this finalizes the execution and writes the report.".into(),
            parameters: obj_schema(
                json!({ "summary": { "type": "string", "description": "One-paragraph outcome summary" } }),
                &["summary"],
            ),
        },
    ];

    for (name, desc) in [
        ("LPT_APBOOKKEEPER", "Submit an accounts-payable bookkeeping batch to the AP worker. Long-running: the run pauses until the worker reports back."),
        ("LPT_ROUTER", "Submit a document routing batch to the router worker. Long-running: the run pauses until the worker reports back."),
        ("LPT_BANKER", "Submit a bank reconciliation batch to the banker worker. Long-running: the run pauses until the worker reports back."),
        ("LPT_HR_JOBBER", "Submit an HR administration batch to the HR worker. Long-running: the run pauses until the worker reports back."),
    ] {
        defs.push(ToolDefinition {
            name: name.into(),
            description: desc.into(),
            parameters: obj_schema(
                json!({
                    "jobs_data": { "type": "array", "description": "Job items for the worker" },
                    "settings": { "type": "array", "description": "Worker settings entries" },
                    "start_instructions": { "type": "string" },
                    "step_id": { "type": "string", "description": "Checklist step this job belongs to" }
                }),
                &["jobs_data"],
            ),
        });
    }

    defs
}

fn checklist_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "CREATE_CHECKLIST".into(),
            description: "Create the run checklist from the plan's step names. Call once, before working the first step.".into(),
            parameters: obj_schema(
                json!({ "steps": { "type": "array", "items": { "type": "string" } } }),
                &["steps"],
            ),
        },
        ToolDefinition {
            name: "UPDATE_STEP".into(),
            description: "Update one checklist step: in_progress when you start it, completed or error when done. Steps never move backward.".into(),
            parameters: obj_schema(
                json!({
                    "step_id": { "type": "string" },
                    "status": { "type": "string", "enum": ["in_progress", "completed", "error"] },
                    "message": { "type": "string" }
                }),
                &["step_id", "status"],
            ),
        },
    ]
}

/// The chat-mode-to-tools binding.
pub fn definitions_for_mode(mode: ChatMode) -> Vec<ToolDefinition> {
    match mode {
        _ if mode.is_department() => Vec::new(),
        ChatMode::TaskExecution | ChatMode::LptCallback => {
            let mut defs = full_suite();
            defs.extend(checklist_tools());
            defs
        }
        _ => full_suite(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn dispatch(
    state: &AppState,
    brain: &mut Brain,
    tool_name: &str,
    arguments: &Value,
) -> DispatchResult {
    match tool_name {
        "GET_COMPANY_PROFILE" => dispatch_company_profile(brain),
        "GET_JOB_STATUS" => dispatch_job_status(brain),
        "UPDATE_JOB_METRICS" => dispatch_update_metrics(state, brain, arguments).await,
        "LIST_TASKS" => dispatch_list_tasks(state, brain).await,
        "CREATE_TASK" => dispatch_create_task(state, brain, arguments).await,
        "CREATE_CHECKLIST" => dispatch_create_checklist(state, brain, arguments).await,
        "UPDATE_STEP" => dispatch_update_step(state, brain, arguments).await,
        "TERMINATE_TASK" => DispatchResult {
            content: json!({ "status": "terminating" }).to_string(),
            is_error: false,
            control: ToolControl::Terminate {
                summary: arguments
                    .get("summary")
                    .and_then(|v| v.as_str())
                    .unwrap_or("task terminated")
                    .to_string(),
            },
        },
        name if crate::workers::worker_route(name).is_some() => {
            dispatch_lpt(state, brain, name, arguments).await
        }
        _ => DispatchResult::err(
            json!({
                "error": format!("Unknown tool: '{tool_name}'"),
                "message": "This tool is not registered for the current chat mode.",
            })
            .to_string(),
        ),
    }
}

fn dispatch_company_profile(brain: &Brain) -> DispatchResult {
    let s = &brain.session;
    DispatchResult::ok(
        json!({
            "mandate_path": s.mandate_path,
            "company_id": s.company_id,
            "country": s.country,
            "timezone": s.timezone,
            "user_language": s.user_language,
            "dms_system": s.dms_system,
        })
        .to_string(),
    )
}

fn dispatch_job_status(brain: &Brain) -> DispatchResult {
    DispatchResult::ok(json!({ "job_metrics": brain.session.job_metrics }).to_string())
}

async fn dispatch_update_metrics(
    state: &AppState,
    brain: &mut Brain,
    arguments: &Value,
) -> DispatchResult {
    let metrics = match arguments.get("metrics") {
        Some(m) => m.clone(),
        None => return DispatchResult::err("missing required argument: metrics"),
    };
    match state
        .sessions
        .update_job_metrics(&brain.user_id, &brain.company_id, metrics.clone())
        .await
    {
        Ok(()) => {
            brain.session.job_metrics = metrics;
            DispatchResult::ok(json!({ "updated": true }).to_string())
        }
        Err(e) => DispatchResult::err(format!("job metrics update failed: {e}")),
    }
}

async fn dispatch_list_tasks(state: &AppState, brain: &Brain) -> DispatchResult {
    match tasks::list_tasks(state.docs.as_ref(), &brain.session.mandate_path).await {
        Ok(list) => {
            let items: Vec<Value> = list
                .iter()
                .map(|t| {
                    json!({
                        "task_id": t.task_id,
                        "title": t.mission.title,
                        "execution_plan": t.execution_plan,
                        "status": t.status,
                        "enabled": t.enabled,
                        "next_execution_utc": t.schedule.next_execution_utc,
                        "execution_count": t.execution_count,
                        "last_report": t.last_execution_report.as_ref().map(|r| &r.summary),
                    })
                })
                .collect();
            DispatchResult::ok(json!({ "tasks": items, "count": items.len() }).to_string())
        }
        Err(e) => DispatchResult::err(format!("task list failed: {e}")),
    }
}

async fn dispatch_create_task(
    state: &AppState,
    brain: &Brain,
    arguments: &Value,
) -> DispatchResult {
    let get_str = |k: &str| arguments.get(k).and_then(|v| v.as_str()).map(String::from);
    let (title, description) = match (get_str("title"), get_str("description")) {
        (Some(t), Some(d)) => (t, d),
        _ => return DispatchResult::err("missing required arguments: title, description"),
    };
    let execution_plan: ExecutionPlan = match arguments
        .get("execution_plan")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(p)) => p,
        _ => return DispatchResult::err("execution_plan must be SCHEDULED, ONE_TIME or ON_DEMAND"),
    };

    let mut schedule = TaskSchedule {
        frequency: arguments
            .get("frequency")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok()),
        time: get_str("time"),
        day_of_week: arguments.get("day_of_week").and_then(|v| v.as_u64()).map(|v| v as u32),
        day_of_month: arguments.get("day_of_month").and_then(|v| v.as_u64()).map(|v| v as u32),
        timezone: brain.session.timezone.clone(),
        ..Default::default()
    };

    if matches!(execution_plan, ExecutionPlan::Scheduled | ExecutionPlan::OneTime) {
        match cron::frequency_to_cron(&schedule) {
            Ok(c) => schedule.cron = c,
            Err(e) => return DispatchResult::err(format!("invalid schedule: {e}")),
        }
        match cron::schedule_next(&schedule, &Utc::now()) {
            Ok((next_utc, next_local)) => {
                schedule.next_execution_utc = Some(next_utc);
                schedule.next_execution_local_time = Some(next_local);
            }
            Err(e) => return DispatchResult::err(format!("invalid schedule: {e}")),
        }
    }

    let task = TaskRecord {
        mandate_path: brain.session.mandate_path.clone(),
        task_id: format!("task-{}", tasks::generate_execution_id()),
        execution_plan,
        mission: Mission {
            title,
            description,
            plan: get_str("plan").unwrap_or_default(),
        },
        schedule,
        status: TaskStatus::Active,
        enabled: true,
        execution_count: 0,
        last_execution_report: None,
        created_at: Some(Utc::now()),
        completed_at: None,
        approval_required: false,
    };

    let save = async {
        tasks::save_task(state.docs.as_ref(), &task).await?;
        tasks::sync_index_entry(state.docs.as_ref(), &task).await
    };
    match save.await {
        Ok(()) => DispatchResult::ok(
            json!({
                "task_id": task.task_id,
                "next_execution_utc": task.schedule.next_execution_utc,
            })
            .to_string(),
        ),
        Err(e) => DispatchResult::err(format!("task creation failed: {e}")),
    }
}

// ── Checklist tools ────────────────────────────────────────────────

async fn dispatch_create_checklist(
    state: &AppState,
    brain: &mut Brain,
    arguments: &Value,
) -> DispatchResult {
    let Some(active) = brain.active_task.clone() else {
        return DispatchResult::err("CREATE_CHECKLIST is only available inside a task run");
    };
    let names: Vec<String> = match arguments.get("steps").and_then(|v| v.as_array()) {
        Some(arr) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        None => return DispatchResult::err("missing required argument: steps"),
    };
    if names.is_empty() {
        return DispatchResult::err("steps must not be empty");
    }

    let checklist = Checklist::new(&names);
    let mut exec = match tasks::load_execution(
        state.docs.as_ref(),
        &active.mandate_path,
        &active.task_id,
        &active.execution_id,
    )
    .await
    {
        Ok(Some(e)) => e,
        Ok(None) => return DispatchResult::err("execution record is gone"),
        Err(e) => return DispatchResult::err(format!("execution load failed: {e}")),
    };
    exec.workflow_checklist = Some(checklist.clone());
    if let Err(e) =
        tasks::save_execution(state.docs.as_ref(), &active.mandate_path, &active.task_id, &exec)
            .await
    {
        return DispatchResult::err(format!("checklist persist failed: {e}"));
    }

    events::publish(
        state.store.as_ref(),
        &brain.streaming_channel(),
        &ThreadEvent::WorkflowChecklist {
            command: CMD_CREATE_CHECKLIST.into(),
            payload: serde_json::to_value(&checklist).unwrap_or(Value::Null),
        },
    )
    .await;

    DispatchResult::ok(
        json!({
            "created": true,
            "total_steps": checklist.total_steps,
            "steps": checklist.steps.iter().map(|s| json!({"id": s.id, "name": s.name})).collect::<Vec<_>>(),
        })
        .to_string(),
    )
}

async fn dispatch_update_step(
    state: &AppState,
    brain: &mut Brain,
    arguments: &Value,
) -> DispatchResult {
    let Some(active) = brain.active_task.clone() else {
        return DispatchResult::err("UPDATE_STEP is only available inside a task run");
    };
    let step_id = match arguments.get("step_id").and_then(|v| v.as_str()) {
        Some(s) => s.to_string(),
        None => return DispatchResult::err("missing required argument: step_id"),
    };
    let status: StepStatus = match arguments
        .get("status")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(s)) => s,
        _ => return DispatchResult::err("status must be in_progress, completed or error"),
    };
    let message = arguments
        .get("message")
        .and_then(|v| v.as_str())
        .map(String::from);

    match super::checklist::update_step(
        state,
        &active,
        &brain.streaming_channel(),
        &step_id,
        status,
        message,
    )
    .await
    {
        Ok(step) => DispatchResult::ok(serde_json::to_string(&step).unwrap_or_default()),
        Err(e) => DispatchResult::err(format!("step update rejected: {e}")),
    }
}

// ── Long-process tools ─────────────────────────────────────────────

async fn dispatch_lpt(
    state: &AppState,
    brain: &mut Brain,
    tool_name: &str,
    arguments: &Value,
) -> DispatchResult {
    let lpt_id = format!("lpt-{}", tasks::generate_execution_id());
    let as_array = |k: &str| -> Vec<Value> {
        arguments
            .get(k)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    };

    let envelope = LptEnvelope {
        collection_name: crate::workers::worker_route(tool_name)
            .unwrap_or("jobs")
            .to_string(),
        user_id: brain.user_id.clone(),
        client_uuid: Uuid::new_v4().to_string(),
        mandates_path: brain.session.mandate_path.clone(),
        batch_id: lpt_id.clone(),
        jobs_data: as_array("jobs_data"),
        settings: as_array("settings"),
        traceability: Traceability {
            thread_key: brain.thread_key.clone(),
            thread_name: Some(brain.thread_key.clone()),
            execution_id: brain.active_task.as_ref().map(|a| a.execution_id.clone()),
            execution_plan: None,
            initiated_at: Utc::now(),
            source: "maestro".into(),
        },
        pub_sub_id: brain.streaming_channel(),
        start_instructions: arguments
            .get("start_instructions")
            .and_then(|v| v.as_str())
            .map(String::from),
        response: None,
        execution_time: None,
        completed_at: None,
        logs_url: None,
    };

    let handle = LptHandle {
        lpt_id: lpt_id.clone(),
        task_type: tool_name.to_string(),
        status: "submitted".into(),
        created_at: Utc::now(),
        step_id: arguments
            .get("step_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        submit: envelope.clone(),
        response: None,
    };

    if let Err(e) = state.workers.submit(tool_name, &envelope).await {
        // Treated exactly like a failed tool result: the agent sees the
        // error and decides what to do next.
        return DispatchResult::err(
            json!({ "status": "failed", "error": e.to_string() }).to_string(),
        );
    }

    // Task runs carry the handle on the execution record (the callback
    // idempotency ledger); plain chat threads carry it in the pause marker.
    if let Some(active) = &brain.active_task {
        if let Err(e) = tasks::attach_lpt_handle(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
            &active.execution_id,
            handle.clone(),
        )
        .await
        {
            tracing::warn!(lpt_id = %lpt_id, error = %e, "LPT handle persist failed");
        }
    }

    DispatchResult {
        content: json!({ "status": "submitted", "lpt_id": lpt_id }).to_string(),
        is_error: false,
        control: ToolControl::PausedOnLpt {
            lpt_id,
            handle: Box::new(handle),
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers used elsewhere
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// RTDB write of a final (sealed) message: exactly one per role per turn.
pub async fn persist_final_message(
    state: &AppState,
    company: &str,
    thread: &str,
    message_id: i64,
    role: &str,
    content: &str,
) {
    let path = paths::message_doc(company, thread, message_id);
    let doc = json!({
        "id": message_id,
        "role": role,
        "content": content,
        "timestamp": Utc::now(),
    });
    if let Err(e) = state.docs.set_doc(&path, doc).await {
        tracing::warn!(path, error = %e, "durable message write failed");
    }
}
