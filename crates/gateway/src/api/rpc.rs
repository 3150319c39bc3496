//! The JSON-RPC gateway: `POST /rpc`.
//!
//! Method dispatch is a compile-time match on the method name; unknown
//! names answer `METHOD_NOT_FOUND` without side effects. Each call runs
//! under the caller's timeout (default from config).

use std::time::Duration;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use ma_domain::chat::ChatMode;
use ma_domain::rpc::{ErrorCode, RpcRequest, RpcResponse};
use ma_domain::task::{ExecutionPlan, Mission, TaskRecord, TaskSchedule, TaskStatus};
use ma_domain::{Error, Result};
use ma_sessions::{StoredMessage, ThreadHistory};
use ma_store::keys;

use crate::runtime::{billing, cron, scheduler, tasks, turn};
use crate::state::AppState;

pub async fn rpc(
    State(state): State<AppState>,
    Json(req): Json<RpcRequest>,
) -> Json<RpcResponse> {
    Json(handle(&state, req).await)
}

/// Dispatch one envelope. Split from the axum wrapper so tests can call
/// it directly.
pub async fn handle(state: &AppState, req: RpcRequest) -> RpcResponse {
    let timeout = Duration::from_millis(
        req.timeout_ms
            .unwrap_or(state.config.server.rpc_timeout_ms),
    );
    let method = req.method.clone();

    let outcome = tokio::time::timeout(timeout, dispatch(state, &req)).await;
    match outcome {
        Ok(Ok(data)) => RpcResponse::ok(data),
        Ok(Err(e)) => {
            let code = ErrorCode::from(&e);
            if code == ErrorCode::Internal {
                tracing::error!(method = %method, error = %e, "rpc failed");
            } else {
                tracing::debug!(method = %method, error = %e, "rpc rejected");
            }
            let resp = RpcResponse::err(code, e.to_string());
            match code {
                ErrorCode::ThreadBusy => resp.retry_after(2_000),
                ErrorCode::RateLimited => resp.retry_after(1_000),
                _ => resp,
            }
        }
        Err(_) => {
            tracing::warn!(method = %method, ?timeout, "rpc timed out");
            RpcResponse::err(ErrorCode::Internal, format!("'{method}' timed out"))
        }
    }
}

async fn dispatch(state: &AppState, req: &RpcRequest) -> Result<Value> {
    match req.method.as_str() {
        "LLM.send_message" => llm_send_message(state, req).await,
        "LLM.stop_streaming" => llm_stop_streaming(state, req).await,
        "LLM.execute_task_now" => llm_execute_task_now(state, req).await,
        "LLM.load_chat_history" => llm_load_chat_history(state, req).await,
        "LLM.flush_chat_history" => llm_flush_chat_history(state, req).await,
        "REGISTRY.register_user" => registry_register_user(state, req).await,
        "REGISTRY.unregister_session" => registry_unregister_session(state, req).await,
        "REGISTRY.heartbeat" => registry_heartbeat(state, req).await,
        "TASK.create_task" => task_create(state, req).await,
        "TASK.update_task" => task_update(state, req).await,
        "TASK.delete_task" => task_delete(state, req).await,
        "TASK.get_task" => task_get(state, req).await,
        "TASK.list_tasks" => task_list(state, req).await,
        other => Err(Error::MethodNotFound(other.to_string())),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM.*
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Start a user turn. Returns the channel and message ids immediately;
/// the turn loop streams in the background while this call's Brain guard
/// keeps the thread serialized.
async fn llm_send_message(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let user = req.str_arg("user", 0)?;
    let company = req.str_arg("company", 1)?;
    let thread = req.str_arg("thread", 2)?;
    let message = req.str_arg("message", 3)?;
    let chat_mode = req.opt_str_arg("chat_mode", 4).map(|m| ChatMode::parse(&m));
    let system_prompt = req.opt_str_arg("system_prompt", 5);
    let wait = req
        .arg("wait", usize::MAX)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    state.sessions.ensure(&user, &company).await?;
    billing::spawn_catchup(state, &user, &company);
    if let Err(e) = state.sessions.register_thread(&user, &company, &thread).await {
        tracing::debug!(error = %e, "thread registration skipped");
    }

    let mut brain = state
        .brains
        .acquire(
            &state.sessions,
            &state.history,
            &user,
            &company,
            &thread,
            chat_mode,
            wait,
        )
        .await?;
    if let Some(prompt) = system_prompt {
        brain.system_prompt = prompt.clone();
        brain.history.system_prompt = Some(prompt);
    }

    let handles = turn::prepare_turn(state, &mut brain, &message).await?;
    let ws_channel = brain.streaming_channel();

    let st = state.clone();
    tokio::spawn(async move {
        let mut brain = brain;
        match turn::execute(&st, &mut brain, handles.assistant_message_id).await {
            Ok(outcome) => {
                tracing::debug!(thread = %brain.thread_key, outcome = ?outcome, "turn finished")
            }
            Err(e) => tracing::error!(thread = %brain.thread_key, error = %e, "turn failed"),
        }
    });

    Ok(json!({
        "ws_channel": ws_channel,
        "user_message_id": handles.user_message_id,
        "assistant_message_id": handles.assistant_message_id,
    }))
}

async fn llm_stop_streaming(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let user = req.str_arg("user", 0)?;
    let company = req.str_arg("company", 1)?;
    let stopped = match req.opt_str_arg("thread", 2) {
        Some(thread) => state.cancel.cancel(&keys::chat_channel(&user, &company, &thread)) as usize,
        None => state
            .cancel
            .cancel_prefix(&format!("chat:{user}:{company}:")),
    };
    Ok(json!({ "stopped": stopped }))
}

async fn llm_execute_task_now(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let mandate_path = req.str_arg("mandate_path", 0)?;
    let task_id = req.str_arg("task_id", 1)?;
    // user/company args are accepted for parity with the frontend call
    // shape; the authoritative owner comes from the mandate document.
    let execution_id = scheduler::fire_task(state, &mandate_path, &task_id, false)
        .await?
        .ok_or_else(|| Error::Other("task was skipped".into()))?;
    Ok(json!({ "execution_id": execution_id, "thread_key": task_id }))
}

/// Rehydrate a thread: with a `history` argument the provided messages
/// replace the stored blob; without one the stored history is returned.
async fn llm_load_chat_history(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let user = req.str_arg("user", 0)?;
    let company = req.str_arg("company", 1)?;
    let thread = req.str_arg("thread", 2)?;

    if let Some(provided) = req.arg("history", 3) {
        let messages: Vec<StoredMessage> = serde_json::from_value(provided.clone())
            .map_err(|e| Error::InvalidArgs(format!("history: {e}")))?;
        let history = ThreadHistory {
            messages,
            last_activity: Some(Utc::now()),
            ..Default::default()
        };
        state.history.save(&user, &company, &thread, &history).await?;
        // Force a rebuild so the Brain picks up the imported history.
        state.brains.evict(&user, &company, &thread);
        return Ok(json!({ "loaded": history.messages.len() }));
    }

    let history = state.history.load(&user, &company, &thread).await;
    state.history.touch(&user, &company, &thread).await;
    Ok(json!({
        "messages": history.messages,
        "chat_mode": history.chat_mode,
        "message_count": history.messages.len(),
    }))
}

async fn llm_flush_chat_history(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let user = req.str_arg("user", 0)?;
    let company = req.str_arg("company", 1)?;
    let thread = req.str_arg("thread", 2)?;
    state.brains.evict(&user, &company, &thread);
    state.history.clear(&user, &company, &thread).await?;
    Ok(json!({ "flushed": true }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REGISTRY.*
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn registry_register_user(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let user = req.str_arg("user", 0)?;
    let session_id = req
        .opt_str_arg("session_id", 1)
        .unwrap_or_else(|| "default".into());
    state.presence.register_session(&user, &session_id).await;
    Ok(json!({ "registered": true }))
}

/// Drop a frontend session. With a `company` argument the (user, company)
/// session is flushed too, unbinding every Brain it owned.
async fn registry_unregister_session(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let user = req.str_arg("user", 0)?;
    state.presence.unregister_user(&user).await;
    let mut flushed_threads = 0usize;
    if let Some(company) = req.opt_str_arg("company", 1) {
        flushed_threads = state.sessions.flush(&user, &company).await.len();
        state.brains.evict_session(&user, &company);
    }
    Ok(json!({ "unregistered": true, "flushed_threads": flushed_threads }))
}

async fn registry_heartbeat(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let user = req.str_arg("user", 0)?;
    state.presence.heartbeat(&user).await;
    Ok(json!({ "online": state.presence.is_user_online(&user).await }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TASK.*
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn spec_str(spec: &Value, key: &str) -> Option<String> {
    spec.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Build a task record from a frontend task spec.
fn task_from_spec(mandate_path: String, spec: &Value) -> Result<TaskRecord> {
    let title = spec_str(spec, "title")
        .ok_or_else(|| Error::InvalidArgs("task.title is required".into()))?;
    let description = spec_str(spec, "description")
        .ok_or_else(|| Error::InvalidArgs("task.description is required".into()))?;
    let execution_plan: ExecutionPlan = spec
        .get("execution_plan")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::InvalidArgs(format!("task.execution_plan: {e}")))?
        .ok_or_else(|| Error::InvalidArgs("task.execution_plan is required".into()))?;

    let mut schedule: TaskSchedule = spec
        .get("schedule")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::InvalidArgs(format!("task.schedule: {e}")))?
        .unwrap_or_default();

    if matches!(
        execution_plan,
        ExecutionPlan::Scheduled | ExecutionPlan::OneTime
    ) && schedule.next_execution_utc.is_none()
    {
        if schedule.cron.is_empty() {
            schedule.cron = cron::frequency_to_cron(&schedule)?;
        }
        let (next_utc, next_local) = cron::schedule_next(&schedule, &Utc::now())?;
        schedule.next_execution_utc = Some(next_utc);
        schedule.next_execution_local_time = Some(next_local);
    }

    Ok(TaskRecord {
        mandate_path,
        task_id: spec_str(spec, "task_id")
            .unwrap_or_else(|| format!("task-{}", tasks::generate_execution_id())),
        execution_plan,
        mission: Mission {
            title,
            description,
            plan: spec_str(spec, "plan").unwrap_or_default(),
        },
        schedule,
        status: TaskStatus::Active,
        enabled: spec.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true),
        execution_count: 0,
        last_execution_report: None,
        created_at: Some(Utc::now()),
        completed_at: None,
        approval_required: spec
            .get("approval_required")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

async fn task_create(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let mandate_path = req.str_arg("mandate_path", 0)?;
    let spec = req
        .arg("task", 1)
        .ok_or_else(|| Error::InvalidArgs("missing argument 'task'".into()))?;
    let task = task_from_spec(mandate_path, spec)?;
    tasks::save_task(state.docs.as_ref(), &task).await?;
    tasks::sync_index_entry(state.docs.as_ref(), &task).await?;
    Ok(json!({
        "task_id": task.task_id,
        "next_execution_utc": task.schedule.next_execution_utc,
        "next_execution_local_time": task.schedule.next_execution_local_time,
    }))
}

async fn task_update(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let mandate_path = req.str_arg("mandate_path", 0)?;
    let task_id = req.str_arg("task_id", 1)?;
    let fields = req
        .arg("fields", 2)
        .ok_or_else(|| Error::InvalidArgs("missing argument 'fields'".into()))?;

    let mut task = tasks::load_task(state.docs.as_ref(), &mandate_path, &task_id).await?;
    if let Some(title) = spec_str(fields, "title") {
        task.mission.title = title;
    }
    if let Some(description) = spec_str(fields, "description") {
        task.mission.description = description;
    }
    if let Some(plan) = spec_str(fields, "plan") {
        task.mission.plan = plan;
    }
    if let Some(enabled) = fields.get("enabled").and_then(|v| v.as_bool()) {
        task.enabled = enabled;
        task.status = if enabled {
            TaskStatus::Active
        } else {
            TaskStatus::Paused
        };
    }
    if let Some(schedule) = fields.get("schedule") {
        let mut new_schedule: TaskSchedule = serde_json::from_value(schedule.clone())
            .map_err(|e| Error::InvalidArgs(format!("fields.schedule: {e}")))?;
        if new_schedule.cron.is_empty() && new_schedule.frequency.is_some() {
            new_schedule.cron = cron::frequency_to_cron(&new_schedule)?;
        }
        if matches!(
            task.execution_plan,
            ExecutionPlan::Scheduled | ExecutionPlan::OneTime
        ) {
            let (next_utc, next_local) = cron::schedule_next(&new_schedule, &Utc::now())?;
            new_schedule.next_execution_utc = Some(next_utc);
            new_schedule.next_execution_local_time = Some(next_local);
        }
        task.schedule = new_schedule;
    }

    tasks::save_task(state.docs.as_ref(), &task).await?;
    tasks::sync_index_entry(state.docs.as_ref(), &task).await?;
    Ok(json!({
        "task_id": task.task_id,
        "enabled": task.enabled,
        "next_execution_utc": task.schedule.next_execution_utc,
    }))
}

async fn task_delete(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let mandate_path = req.str_arg("mandate_path", 0)?;
    let task_id = req.str_arg("task_id", 1)?;
    tasks::delete_task(state.docs.as_ref(), &mandate_path, &task_id).await?;
    Ok(json!({ "deleted": true }))
}

async fn task_get(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let mandate_path = req.str_arg("mandate_path", 0)?;
    let task_id = req.str_arg("task_id", 1)?;
    let task = tasks::load_task(state.docs.as_ref(), &mandate_path, &task_id).await?;
    Ok(serde_json::to_value(task)?)
}

async fn task_list(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let mandate_path = req.str_arg("mandate_path", 0)?;
    let list = tasks::list_tasks(state.docs.as_ref(), &mandate_path).await?;
    Ok(json!({ "tasks": list, "count": list.len() }))
}
