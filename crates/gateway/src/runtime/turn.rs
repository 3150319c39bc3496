//! The workflow executor — the turn-loop driver.
//!
//! Given a trigger (user message, task-execution start, or LPT callback
//! resumption), runs LLM turns against the thread's Brain, dispatches tool
//! calls, streams partial output to subscribed clients, and ends in
//! exactly one of three terminal states: the turn completed, the workflow
//! parked itself waiting for a worker callback, or the agent terminated
//! its task.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use ma_domain::chat::{ContentPart, Message, MessageContent, Role, ToolCall};
use ma_domain::stream::{StreamEvent, Usage};
use ma_domain::task::LptHandle;
use ma_providers::ChatRequest;
use ma_sessions::history::ActiveExecution;
use ma_sessions::StoredMessage;
use ma_store::keys;

use crate::state::AppState;

use super::brain::{estimate_tokens, Brain};
use super::cancel::CancelToken;
use super::events::{self, StreamMetadata, ThreadEvent};
use super::tools::{self, ToolControl};
use super::{prompts, tasks};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal states
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a workflow invocation ended. Callers match exhaustively; pausing is
/// a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    EndTurn,
    PausedOnLpt { lpt_id: String },
    Terminated,
}

/// Marker persisted under `workflow_state:{company}:{thread}` while a
/// workflow waits for a worker callback. If this instance dies, whoever
/// handles the callback rebuilds the Brain from the stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedWorkflow {
    pub status: String,
    pub expected_lpt: String,
    pub paused_at: DateTime<Utc>,
    pub user_id: String,
    pub company_id: String,
    pub thread_key: String,
    #[serde(default)]
    pub active_task: Option<ActiveExecution>,
    /// Callback idempotency ledger for threads without an execution record.
    #[serde(default)]
    pub handle: Option<LptHandle>,
}

/// Pause markers also get a TTL as a leak guard; the watchdog times them
/// out long before this.
const PAUSE_MARKER_TTL_SECS: u64 = 7 * 24 * 3600;

/// Message ids handed back to the RPC caller before the turn loop runs.
#[derive(Debug, Clone, Copy)]
pub struct TurnHandles {
    pub user_message_id: i64,
    pub assistant_message_id: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn preparation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append the trigger message and the streaming assistant placeholder,
/// persist both, and write the one durable copy of the trigger message.
///
/// Runs synchronously under the Brain guard so `send_message` can return
/// the ids before the loop starts streaming.
pub async fn prepare_turn(
    state: &AppState,
    brain: &mut Brain,
    trigger_text: &str,
) -> ma_domain::Result<TurnHandles> {
    let mut user_msg = StoredMessage::user(trigger_text);
    user_msg.id = state.history.next_message_id();
    let user_message_id = user_msg.id;
    brain.history.messages.push(user_msg);
    brain.token_count += estimate_tokens(trigger_text.len());

    let mut placeholder = StoredMessage::streaming_placeholder();
    placeholder.id = state.history.next_message_id();
    let assistant_message_id = placeholder.id;
    brain.history.messages.push(placeholder);

    save_history(state, brain).await?;
    tools::persist_final_message(
        state,
        &brain.company_id,
        &brain.thread_key,
        user_message_id,
        "user",
        trigger_text,
    )
    .await;

    Ok(TurnHandles {
        user_message_id,
        assistant_message_id,
    })
}

async fn save_history(state: &AppState, brain: &Brain) -> ma_domain::Result<()> {
    state
        .history
        .save(
            &brain.user_id,
            &brain.company_id,
            &brain.thread_key,
            &brain.history,
        )
        .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The turn loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the turn loop until a terminal state. The caller holds the Brain
/// guard (the per-thread serializer) for the whole call.
pub async fn execute(
    state: &AppState,
    brain: &mut Brain,
    assistant_message_id: i64,
) -> ma_domain::Result<WorkflowOutcome> {
    let channel = brain.streaming_channel();
    let cancel = state.cancel.register(&channel);
    let result = execute_inner(state, brain, assistant_message_id, &cancel).await;
    state.cancel.remove(&channel);
    result
}

async fn execute_inner(
    state: &AppState,
    brain: &mut Brain,
    assistant_message_id: i64,
    cancel: &CancelToken,
) -> ma_domain::Result<WorkflowOutcome> {
    let channel = brain.streaming_channel();
    let ui_connected = state.presence.is_connected(&channel).await;
    let started = std::time::Instant::now();
    let mut accumulated = String::new();
    let mut seq: u64 = 0;
    let mut total_usage = Usage::default();

    if ui_connected {
        events::publish(
            state.store.as_ref(),
            &channel,
            &ThreadEvent::LlmStreamStart {
                message_id: assistant_message_id,
                thread_key: brain.thread_key.clone(),
                space_code: brain.company_id.clone(),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    let mut messages = build_llm_messages(brain);

    let max_turns = state.config.llm.max_turns;
    for turn_idx in 0..max_turns {
        tracing::debug!(thread = %brain.thread_key, turn_idx, tokens = brain.token_count, "turn loop iteration");

        if resummarize_if_needed(state, brain).await {
            messages = build_llm_messages(brain);
        }

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tools::definitions_for_mode(brain.chat_mode),
            temperature: Some(0.2),
            max_tokens: None,
            model: None,
        };

        let mut stream = match state.llm.chat_stream(req).await {
            Ok(s) => s,
            Err(e) => {
                return fail_turn(
                    state,
                    brain,
                    assistant_message_id,
                    ui_connected,
                    &accumulated,
                    &e.to_string(),
                )
                .await;
            }
        };

        // ── Consume the stream ────────────────────────────────────
        let mut turn_text = String::new();
        let mut pending: Vec<ToolCall> = Vec::new();
        // call_id -> (name, args buffer) for providers that only stream deltas.
        let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
        let mut turn_usage: Option<Usage> = None;
        let mut was_cancelled = false;
        let mut provider_error: Option<String> = None;
        let mut chunk_count: u32 = 0;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    provider_error = Some(e.to_string());
                    break;
                }
            };
            match event {
                StreamEvent::Token { text } => {
                    turn_text.push_str(&text);
                    accumulated.push_str(&text);
                    set_placeholder(brain, assistant_message_id, &accumulated, true);
                    if ui_connected {
                        seq += 1;
                        events::publish(
                            state.store.as_ref(),
                            &channel,
                            &ThreadEvent::LlmStreamChunk {
                                message_id: assistant_message_id,
                                seq,
                                chunk: text,
                                accumulated: accumulated.clone(),
                                is_final: false,
                            },
                        )
                        .await;
                    }
                    // Periodic flush so a rebuild mid-stream loses little.
                    chunk_count += 1;
                    if chunk_count % 16 == 0 {
                        let _ = save_history(state, brain).await;
                    }
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    tc_bufs.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    tc_bufs.remove(&call_id);
                    pending.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done { usage, .. } => {
                    turn_usage = usage;
                }
                StreamEvent::Error { message } => {
                    provider_error = Some(message);
                    break;
                }
            }
        }

        if was_cancelled {
            return interrupt_turn(state, brain, assistant_message_id, &accumulated).await;
        }
        if let Some(err) = provider_error {
            return fail_turn(
                state,
                brain,
                assistant_message_id,
                ui_connected,
                &accumulated,
                &err,
            )
            .await;
        }

        // Assemble calls that streamed start/delta but no finish.
        for (call_id, (name, args_str)) in tc_bufs.drain() {
            let arguments = if args_str.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&args_str).unwrap_or_else(|e| {
                    tracing::warn!(call_id = %call_id, tool = %name, error = %e, "tool arguments are not valid JSON, defaulting to empty object");
                    serde_json::Value::Object(Default::default())
                })
            };
            pending.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }

        if let Some(u) = &turn_usage {
            brain.record_usage(u);
            total_usage.accumulate(u);
        }

        // ── No tool calls: the turn is complete ───────────────────
        if pending.is_empty() {
            complete_turn(
                state,
                brain,
                assistant_message_id,
                ui_connected,
                &accumulated,
                &total_usage,
                started.elapsed().as_millis() as u64,
                "completed",
            )
            .await?;
            return Ok(WorkflowOutcome::EndTurn);
        }

        // ── Tool dispatch ─────────────────────────────────────────
        messages.push(build_assistant_tool_message(&turn_text, &pending));

        for tc in &pending {
            if cancel.is_cancelled() {
                return interrupt_turn(state, brain, assistant_message_id, &accumulated).await;
            }

            let result = tools::dispatch(state, brain, &tc.tool_name, &tc.arguments).await;
            tracing::debug!(tool = %tc.tool_name, is_error = result.is_error, "tool dispatched");

            let mut tool_msg = StoredMessage::tool_result(
                tc.call_id.clone(),
                tc.tool_name.clone(),
                result.content.clone(),
                Some(json!({ "arguments": tc.arguments, "is_error": result.is_error })),
            );
            tool_msg.id = state.history.next_message_id();
            brain.history.messages.push(tool_msg);
            messages.push(Message::tool_result(&tc.call_id, &result.content));

            match result.control {
                ToolControl::Continue => {}
                ToolControl::PausedOnLpt { lpt_id, handle } => {
                    save_history(state, brain).await?;
                    persist_paused_state(state, brain, &lpt_id, *handle).await?;
                    complete_turn(
                        state,
                        brain,
                        assistant_message_id,
                        ui_connected,
                        &accumulated,
                        &total_usage,
                        started.elapsed().as_millis() as u64,
                        "paused_on_lpt",
                    )
                    .await?;
                    return Ok(WorkflowOutcome::PausedOnLpt { lpt_id });
                }
                ToolControl::Terminate { summary } => {
                    save_history(state, brain).await?;
                    if let Some(active) = brain.active_task.clone() {
                        // A failed finalize leaves the execution in place
                        // for a later retry; the turn still terminates.
                        if let Err(e) = tasks::finalize_execution(
                            state.docs.as_ref(),
                            &active.mandate_path,
                            &active.task_id,
                            &active.execution_id,
                            summary,
                        )
                        .await
                        {
                            tracing::warn!(execution_id = %active.execution_id, error = %e, "finalization failed, execution left for retry");
                        } else {
                            brain.active_task = None;
                            brain.history.active_execution = None;
                        }
                    }
                    complete_turn(
                        state,
                        brain,
                        assistant_message_id,
                        ui_connected,
                        &accumulated,
                        &total_usage,
                        started.elapsed().as_millis() as u64,
                        "terminated",
                    )
                    .await?;
                    return Ok(WorkflowOutcome::Terminated);
                }
            }
        }

        save_history(state, brain).await?;
    }

    // Loop cap reached.
    tracing::warn!(thread = %brain.thread_key, max_turns, "turn loop limit reached");
    complete_turn(
        state,
        brain,
        assistant_message_id,
        ui_connected,
        &accumulated,
        &total_usage,
        started.elapsed().as_millis() as u64,
        "max_turns",
    )
    .await?;
    Ok(WorkflowOutcome::EndTurn)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn set_placeholder(brain: &mut Brain, message_id: i64, content: &str, still_streaming: bool) {
    if let Some(msg) = brain
        .history
        .messages
        .iter_mut()
        .find(|m| m.id == message_id)
    {
        msg.content = content.to_string();
        msg.streaming = still_streaming;
    }
}

/// Seal the assistant placeholder, persist history, write the single
/// durable assistant message, and emit the completion event.
#[allow(clippy::too_many_arguments)]
async fn complete_turn(
    state: &AppState,
    brain: &mut Brain,
    message_id: i64,
    ui_connected: bool,
    content: &str,
    usage: &Usage,
    duration_ms: u64,
    status: &str,
) -> ma_domain::Result<()> {
    set_placeholder(brain, message_id, content, false);
    brain.history.last_activity = Some(Utc::now());
    save_history(state, brain).await?;
    tools::persist_final_message(
        state,
        &brain.company_id,
        &brain.thread_key,
        message_id,
        "assistant",
        content,
    )
    .await;

    if ui_connected {
        events::publish(
            state.store.as_ref(),
            &brain.streaming_channel(),
            &ThreadEvent::LlmStreamComplete {
                message_id,
                full_content: content.to_string(),
                metadata: StreamMetadata {
                    tokens_used: usage.total_tokens,
                    duration_ms,
                    model: state.config.llm.model.clone(),
                    status: status.to_string(),
                    completed_at: Utc::now(),
                },
            },
        )
        .await;
    }
    Ok(())
}

/// Cancellation at a chunk boundary: seal what we have with a truncation
/// marker and tell subscribers.
async fn interrupt_turn(
    state: &AppState,
    brain: &mut Brain,
    message_id: i64,
    accumulated: &str,
) -> ma_domain::Result<WorkflowOutcome> {
    let sealed = if accumulated.is_empty() {
        String::new()
    } else {
        format!("{accumulated}\n\n[interrupted]")
    };
    set_placeholder(brain, message_id, &sealed, false);
    save_history(state, brain).await?;
    tools::persist_final_message(
        state,
        &brain.company_id,
        &brain.thread_key,
        message_id,
        "assistant",
        &sealed,
    )
    .await;
    events::publish(
        state.store.as_ref(),
        &brain.streaming_channel(),
        &ThreadEvent::LlmStreamInterrupted {
            message_id,
            accumulated: accumulated.to_string(),
        },
    )
    .await;
    tracing::info!(thread = %brain.thread_key, "stream interrupted by user");
    Ok(WorkflowOutcome::EndTurn)
}

/// Provider failure after retries: seal a stub so the thread never keeps a
/// half-written message, and emit the error event.
async fn fail_turn(
    state: &AppState,
    brain: &mut Brain,
    message_id: i64,
    ui_connected: bool,
    accumulated: &str,
    error: &str,
) -> ma_domain::Result<WorkflowOutcome> {
    tracing::error!(thread = %brain.thread_key, error, "turn failed");
    let sealed = if accumulated.is_empty() {
        "The assistant could not produce a response. Please try again.".to_string()
    } else {
        format!("{accumulated}\n\n[response incomplete]")
    };
    set_placeholder(brain, message_id, &sealed, false);
    save_history(state, brain).await?;
    tools::persist_final_message(
        state,
        &brain.company_id,
        &brain.thread_key,
        message_id,
        "assistant",
        &sealed,
    )
    .await;
    if ui_connected {
        events::publish(
            state.store.as_ref(),
            &brain.streaming_channel(),
            &ThreadEvent::LlmStreamError {
                message_id,
                error: error.to_string(),
            },
        )
        .await;
    }
    Ok(WorkflowOutcome::EndTurn)
}

async fn persist_paused_state(
    state: &AppState,
    brain: &Brain,
    lpt_id: &str,
    handle: LptHandle,
) -> ma_domain::Result<()> {
    let marker = PausedWorkflow {
        status: "waiting_lpt".into(),
        expected_lpt: lpt_id.to_string(),
        paused_at: Utc::now(),
        user_id: brain.user_id.clone(),
        company_id: brain.company_id.clone(),
        thread_key: brain.thread_key.clone(),
        active_task: brain.active_task.clone(),
        handle: if brain.active_task.is_none() {
            Some(handle)
        } else {
            None
        },
    };
    state
        .store
        .set(
            &keys::workflow_state(&brain.company_id, &brain.thread_key),
            &serde_json::to_string(&marker)?,
            Some(PAUSE_MARKER_TTL_SECS),
        )
        .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context reconstruction & resummarization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rebuild the provider message list from the Brain.
///
/// Tool entries expand to the assistant tool_use / tool_result pair the
/// provider expects; in-flight streaming placeholders are skipped.
pub fn build_llm_messages(brain: &Brain) -> Vec<Message> {
    let mut msgs = vec![Message::system(&brain.system_prompt)];
    for m in &brain.history.messages {
        match m.role {
            Role::User => msgs.push(Message::user(&m.content)),
            Role::System => msgs.push(Message::system(&m.content)),
            Role::Assistant => {
                if m.streaming || m.content.is_empty() {
                    continue;
                }
                msgs.push(Message::assistant(&m.content));
            }
            Role::Tool => {
                if let (Some(call_id), Some(tool_name)) = (&m.tool_call_id, &m.tool_name) {
                    let args = m
                        .tool_payload
                        .as_ref()
                        .and_then(|p| p.get("arguments"))
                        .cloned()
                        .unwrap_or(serde_json::Value::Object(Default::default()));
                    msgs.push(Message {
                        role: Role::Assistant,
                        content: MessageContent::Parts(vec![ContentPart::ToolUse {
                            id: call_id.clone(),
                            name: tool_name.clone(),
                            input: args,
                        }]),
                    });
                    msgs.push(Message::tool_result(call_id, &m.content));
                }
            }
        }
    }
    msgs
}

pub(super) fn build_assistant_tool_message(text: &str, tool_calls: &[ToolCall]) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });
    }
    for tc in tool_calls {
        parts.push(ContentPart::ToolUse {
            id: tc.call_id.clone(),
            name: tc.tool_name.clone(),
            input: tc.arguments.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

const SUMMARY_MARKER: &str = "\n\n## Conversation summary\n";

/// Compress the context once the soft token budget is crossed. Idempotent
/// under retry: a summarization already in flight is coalesced, and a
/// failure falls back to the uncompressed history.
async fn resummarize_if_needed(state: &AppState, brain: &mut Brain) -> bool {
    if brain.token_count < state.config.llm.token_budget || brain.summarizing {
        return false;
    }
    brain.summarizing = true;
    let result = resummarize(state, brain).await;
    brain.summarizing = false;
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(thread = %brain.thread_key, error = %e, "resummarization failed, continuing with full history");
            false
        }
    }
}

async fn resummarize(state: &AppState, brain: &mut Brain) -> ma_domain::Result<()> {
    tracing::info!(thread = %brain.thread_key, tokens = brain.token_count, "resummarizing context");

    let mut messages = build_llm_messages(brain);
    messages.push(Message::user(prompts::summarization_instruction()));
    let resp = state
        .llm
        .chat(ChatRequest {
            messages,
            tools: Vec::new(),
            temperature: Some(0.0),
            max_tokens: Some(2048),
            model: None,
        })
        .await?;

    // Replace any previous summary section on the prompt.
    let base = match brain.system_prompt.find(SUMMARY_MARKER) {
        Some(pos) => &brain.system_prompt[..pos],
        None => brain.system_prompt.as_str(),
    };
    brain.system_prompt = format!("{base}{SUMMARY_MARKER}{}", resp.content);

    // Keep the last N raw exchanges; the summary covers the rest.
    let keep = state.config.llm.keep_last_turns * 2;
    if brain.history.messages.len() > keep {
        let cut = brain.history.messages.len() - keep;
        brain.history.messages.drain(..cut);
    }
    brain.history.system_prompt = Some(brain.system_prompt.clone());
    save_history(state, brain).await?;

    brain.token_count = estimate_tokens(
        brain.system_prompt.len()
            + brain
                .history
                .messages
                .iter()
                .map(|m| m.content.len())
                .sum::<usize>(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{scripted_state, turn_with_tool, StreamScript};
    use ma_domain::chat::ChatMode;
    use ma_domain::task::{LptOutcome, LptResponse, StepStatus};

    // ── Pure helpers ───────────────────────────────────────────────

    #[test]
    fn assistant_tool_message_shapes() {
        let calls = vec![ToolCall {
            call_id: "tc_1".into(),
            tool_name: "GET_JOB_STATUS".into(),
            arguments: json!({}),
        }];
        let msg = build_assistant_tool_message("checking", &calls);
        match msg.content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], ContentPart::Text { .. }));
                assert!(matches!(parts[1], ContentPart::ToolUse { .. }));
            }
            _ => panic!("expected parts"),
        }
    }

    #[tokio::test]
    async fn llm_messages_skip_streaming_placeholder() {
        let (state, _) = scripted_state(vec![]).await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        prepare_turn(&state, &mut brain, "hello").await.unwrap();
        let msgs = build_llm_messages(&brain);
        // system + user; the streaming placeholder is excluded.
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, Role::User);
    }

    #[tokio::test]
    async fn tool_history_expands_to_use_result_pair() {
        let (state, _) = scripted_state(vec![]).await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let mut tool_msg = StoredMessage::tool_result(
            "tc_7",
            "GET_JOB_STATUS",
            "{\"jobs\":0}",
            Some(json!({"arguments": {"x": 1}})),
        );
        tool_msg.id = 1;
        brain.history.messages.push(tool_msg);
        let msgs = build_llm_messages(&brain);
        assert_eq!(msgs.len(), 3); // system + assistant tool_use + tool result
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[2].role, Role::Tool);
    }

    // ── Simple chat turn ───────────────────────────────────────────

    #[tokio::test]
    async fn plain_turn_streams_and_seals() {
        let (state, _) = scripted_state(vec![StreamScript::text(&["Hel", "lo ", "there"])]).await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let handles = prepare_turn(&state, &mut brain, "hi").await.unwrap();
        let outcome = execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        assert_eq!(outcome, WorkflowOutcome::EndTurn);

        let history = state.history.load("u1", "acme", "t1").await;
        let last = history.messages.last().unwrap();
        assert_eq!(last.id, handles.assistant_message_id);
        assert_eq!(last.content, "Hello there");
        assert!(!last.streaming);

        // Exactly one durable write per role.
        let user_doc = state
            .docs
            .get_doc(&ma_docstore::paths::message_doc(
                "acme",
                "t1",
                handles.user_message_id,
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user_doc["content"], "hi");
        let asst_doc = state
            .docs
            .get_doc(&ma_docstore::paths::message_doc(
                "acme",
                "t1",
                handles.assistant_message_id,
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(asst_doc["content"], "Hello there");
    }

    #[tokio::test]
    async fn streamed_turn_produces_prefix_chain() {
        use futures_util::StreamExt;
        let (state, _) = scripted_state(vec![StreamScript::text(&["a", "b", "c"])]).await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let channel = brain.streaming_channel();
        state.presence.register(&channel, "u1").await;
        let mut sub = state.store.subscribe(&channel).await.unwrap();

        let handles = prepare_turn(&state, &mut brain, "go").await.unwrap();
        execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), sub.next()).await
        {
            events.push(serde_json::from_str::<serde_json::Value>(&msg.payload).unwrap());
        }
        assert_eq!(events.first().unwrap()["type"], "llm_stream_start");
        let chunks: Vec<&serde_json::Value> = events
            .iter()
            .filter(|e| e["type"] == "llm_stream_chunk")
            .collect();
        assert_eq!(chunks.len(), 3);
        let mut prev = String::new();
        let mut prev_seq = 0;
        for c in &chunks {
            let acc = c["accumulated"].as_str().unwrap();
            assert!(acc.starts_with(&prev), "accumulated is a prefix chain");
            prev = acc.to_string();
            let s = c["seq"].as_u64().unwrap();
            assert!(s > prev_seq);
            prev_seq = s;
        }
        let complete = events
            .iter()
            .find(|e| e["type"] == "llm_stream_complete")
            .expect("exactly one complete event");
        assert_eq!(complete["full_content"].as_str().unwrap(), prev);
    }

    #[tokio::test]
    async fn headless_turn_publishes_nothing() {
        use futures_util::StreamExt;
        let (state, _) = scripted_state(vec![StreamScript::text(&["quiet"])]).await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let channel = brain.streaming_channel();
        let mut sub = state.store.subscribe(&channel).await.unwrap();

        let handles = prepare_turn(&state, &mut brain, "go").await.unwrap();
        execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_millis(100), sub.next()).await;
        assert!(got.is_err(), "no events for a non-UI-connected caller");
    }

    // ── Tool turns ─────────────────────────────────────────────────

    #[tokio::test]
    async fn spt_tool_result_feeds_next_turn() {
        let (state, _) = scripted_state(vec![
            turn_with_tool("tc_1", "GET_JOB_STATUS", json!({})),
            StreamScript::text(&["All queues are empty."]),
        ])
        .await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let handles = prepare_turn(&state, &mut brain, "status?").await.unwrap();
        let outcome = execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        assert_eq!(outcome, WorkflowOutcome::EndTurn);

        let history = state.history.load("u1", "acme", "t1").await;
        let tool_entry = history
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool result recorded");
        assert_eq!(tool_entry.tool_name.as_deref(), Some("GET_JOB_STATUS"));
        assert!(tool_entry.content.contains("job_metrics"));
        let assistant = history
            .messages
            .iter()
            .find(|m| m.id == handles.assistant_message_id)
            .unwrap();
        assert_eq!(assistant.content, "All queues are empty.");
        assert!(!assistant.streaming);
    }

    #[tokio::test]
    async fn lpt_submission_pauses_the_workflow() {
        let (state, workers) = scripted_state(vec![turn_with_tool(
            "tc_1",
            "LPT_BANKER",
            json!({"jobs_data": [{"account": "CH93"}]}),
        )])
        .await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let handles = prepare_turn(&state, &mut brain, "reconcile").await.unwrap();
        let outcome = execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();

        let lpt_id = match outcome {
            WorkflowOutcome::PausedOnLpt { lpt_id } => lpt_id,
            other => panic!("expected pause, got {other:?}"),
        };
        assert_eq!(workers.submissions.lock().len(), 1);

        // The pause marker is in place and carries the expected lpt id.
        let raw = state
            .store
            .get(&keys::workflow_state("acme", "t1"))
            .await
            .expect("pause marker persisted");
        let marker: PausedWorkflow = serde_json::from_str(&raw).unwrap();
        assert_eq!(marker.expected_lpt, lpt_id);
        assert_eq!(marker.status, "waiting_lpt");
        // Non-task thread: the handle rides in the marker as the ledger.
        assert!(marker.handle.is_some());
    }

    #[tokio::test]
    async fn worker_submit_failure_is_a_tool_error_not_a_pause() {
        let (state, workers) = scripted_state(vec![
            turn_with_tool("tc_1", "LPT_BANKER", json!({"jobs_data": []})),
            StreamScript::text(&["The worker refused the batch."]),
        ])
        .await;
        workers.fail_next();
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let handles = prepare_turn(&state, &mut brain, "reconcile").await.unwrap();
        let outcome = execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        // The workflow continued to a normal end instead of pausing.
        assert_eq!(outcome, WorkflowOutcome::EndTurn);
        assert!(state.store.get(&keys::workflow_state("acme", "t1")).await.is_none());
    }

    // ── Cancellation ───────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_mid_stream_seals_partial() {
        let (state, _) = scripted_state(vec![StreamScript::slow_text(&["one ", "two ", "three"])]).await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let channel = brain.streaming_channel();
        let handles = prepare_turn(&state, &mut brain, "go").await.unwrap();

        let cancel_map = state.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(75)).await;
            cancel_map.cancel(&channel);
        });

        let outcome = execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        assert_eq!(outcome, WorkflowOutcome::EndTurn);

        let history = state.history.load("u1", "acme", "t1").await;
        let last = history.messages.last().unwrap();
        assert!(!last.streaming, "placeholder sealed");
        // Whatever was accumulated is preserved; if anything streamed, the
        // truncation marker is appended.
        if !last.content.is_empty() {
            assert!(last.content.ends_with("[interrupted]"));
        }
    }

    // ── Resummarization ────────────────────────────────────────────

    #[tokio::test]
    async fn over_budget_context_is_resummarized_before_the_turn() {
        let (state, _) = scripted_state(vec![StreamScript::text(&["ok"])]).await;
        // Scripted provider answers `chat` with a fixed summary.
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        for i in 0..40 {
            let mut m = StoredMessage::user(format!("filler message {i}"));
            m.id = i + 1;
            brain.history.messages.push(m);
        }
        brain.token_count = state.config.llm.token_budget; // exactly at the limit
        let handles = prepare_turn(&state, &mut brain, "continue").await.unwrap();
        execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();

        assert!(brain.system_prompt.contains("## Conversation summary"));
        let keep = state.config.llm.keep_last_turns * 2;
        assert!(brain.history.messages.len() <= keep + 1);
        assert!(brain.token_count < state.config.llm.token_budget);
    }

    // ── Checklist step updates through the shared path ─────────────

    #[tokio::test]
    async fn update_step_is_monotone_and_idempotent() {
        let (state, _) = scripted_state(vec![]).await;
        let active = state.seed_task_execution("u1", "acme").await;
        let channel = keys::chat_channel("u1", "acme", &active.task_id);

        let step = crate::runtime::checklist::update_step(
            &state,
            &active,
            &channel,
            "step_1",
            StepStatus::Completed,
            Some("42 transactions reconciled".into()),
        )
        .await
        .unwrap();
        assert_eq!(step.status, StepStatus::Completed);

        // Converges on repeat.
        crate::runtime::checklist::update_step(
            &state,
            &active,
            &channel,
            "step_1",
            StepStatus::Completed,
            Some("42 transactions reconciled".into()),
        )
        .await
        .unwrap();

        // Never backward.
        let err = crate::runtime::checklist::update_step(
            &state,
            &active,
            &channel,
            "step_1",
            StepStatus::InProgress,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ma_domain::Error::InvalidArgs(_)));
    }

    // ── Terminate inside a task run ────────────────────────────────

    #[tokio::test]
    async fn terminate_finalizes_and_deletes_execution() {
        let (state, _) = scripted_state(vec![turn_with_tool(
            "tc_1",
            "TERMINATE_TASK",
            json!({"summary": "all reconciled"}),
        )])
        .await;
        let active = state.seed_task_execution("u1", "acme").await;
        let mut brain = state.test_brain("u1", "acme", &active.task_id).await;
        brain.chat_mode = ChatMode::TaskExecution;
        brain.active_task = Some(active.clone());

        let handles = prepare_turn(&state, &mut brain, "finish up").await.unwrap();
        let outcome = execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        assert_eq!(outcome, WorkflowOutcome::Terminated);

        let task = tasks::load_task(state.docs.as_ref(), &active.mandate_path, &active.task_id)
            .await
            .unwrap();
        assert_eq!(
            task.last_execution_report.unwrap().summary,
            "all reconciled"
        );
        assert!(tasks::load_execution(
            state.docs.as_ref(),
            &active.mandate_path,
            &active.task_id,
            &active.execution_id
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn terminate_outside_task_just_ends() {
        let (state, _) = scripted_state(vec![turn_with_tool(
            "tc_1",
            "TERMINATE_TASK",
            json!({"summary": "done"}),
        )])
        .await;
        let mut brain = state.test_brain("u1", "acme", "t1").await;
        let handles = prepare_turn(&state, &mut brain, "stop").await.unwrap();
        let outcome = execute(&state, &mut brain, handles.assistant_message_id)
            .await
            .unwrap();
        assert_eq!(outcome, WorkflowOutcome::Terminated);
    }

    // ── LPT response summaries ─────────────────────────────────────

    #[test]
    fn continuation_message_quotes_worker_summary() {
        let resp = LptResponse {
            status: LptOutcome::Completed,
            result: Some(json!({"summary": "42 transactions reconciled"})),
            error: None,
        };
        let text = prompts::lpt_continuation("lpt-1", resp.status, &resp.summary_text());
        assert!(text.contains("42 transactions reconciled"));
    }
}
