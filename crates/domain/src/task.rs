//! Task, execution, and checklist data model.
//!
//! A [`TaskRecord`] is the durable description of an agent mission and its
//! schedule. Each run of a task is an ephemeral [`ExecutionRecord`] whose
//! progress is tracked by a [`Checklist`]; asynchronous worker jobs spawned
//! during a run are recorded as [`LptHandle`]s keyed by `lpt_id`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a task is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPlan {
    /// Fires on a recurring schedule (daily/weekly/monthly).
    Scheduled,
    /// Fires once at `next_execution_utc`, then retires.
    OneTime,
    /// Fires only via an explicit execute-now request.
    OnDemand,
    /// Created and fired immediately.
    Now,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

/// What the agent is asked to accomplish.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mission {
    pub title: String,
    pub description: String,
    /// Free-form plan text the agent follows (and may revise mid-run).
    #[serde(default)]
    pub plan: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// Schedule of a SCHEDULED / ONE_TIME task.
///
/// `next_execution_utc` is the canonical trigger time; the local-time field
/// is a display mirror only and is never consulted by the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSchedule {
    /// 5-field cron expression evaluated in `timezone`.
    #[serde(default)]
    pub cron: String,
    #[serde(default)]
    pub frequency: Option<Frequency>,
    /// 0 = Sunday .. 6 = Saturday (weekly tasks).
    #[serde(default)]
    pub day_of_week: Option<u32>,
    /// 1..=31 (monthly tasks).
    #[serde(default)]
    pub day_of_month: Option<u32>,
    /// "HH:MM" in the task's timezone.
    #[serde(default)]
    pub time: Option<String>,
    /// IANA timezone name. Resolved from the mandate's country when absent.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub next_execution_utc: Option<DateTime<Utc>>,
    /// Display mirror of `next_execution_utc` in the task's timezone.
    #[serde(default)]
    pub next_execution_local_time: Option<String>,
}

/// Durable description of an agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub mandate_path: String,
    pub task_id: String,
    pub execution_plan: ExecutionPlan,
    pub mission: Mission,
    #[serde(default)]
    pub schedule: TaskSchedule,
    pub status: TaskStatus,
    pub enabled: bool,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub last_execution_report: Option<ExecutionReport>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Frontend render hint only; never consulted by the core.
    #[serde(default)]
    pub approval_required: bool,
}

/// Scheduler index mirror of a task. One entry per active SCHEDULED or
/// ONE_TIME task, keyed by the slugified job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub mandate_path: String,
    pub task_id: String,
    pub enabled: bool,
    pub next_execution_utc: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

/// One concrete run of a task. Ephemeral: deleted once its report has been
/// promoted to the parent task's `last_execution_report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    /// Equals the task id so thread history persists across runs.
    pub thread_key: String,
    pub started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub workflow_checklist: Option<Checklist>,
    #[serde(default)]
    pub lpt_tasks: BTreeMap<String, LptHandle>,
}

impl ExecutionRecord {
    pub fn new(execution_id: String, thread_key: String, started_at: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            thread_key,
            started_at,
            status: ExecutionStatus::Running,
            workflow_checklist: None,
            lpt_tasks: BTreeMap::new(),
        }
    }
}

/// Structured outcome of a finished execution, promoted onto the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub summary: String,
    pub steps_total: u32,
    pub steps_completed: u32,
    pub steps_errored: u32,
    pub finished_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Checklist
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl StepStatus {
    /// Steps only move forward: pending → in_progress → {completed, error}.
    /// Re-asserting the current status is allowed (idempotent updates).
    pub fn can_transition(self, to: StepStatus) -> bool {
        use StepStatus::*;
        match (self, to) {
            (a, b) if a == b => true,
            (Pending, InProgress) | (Pending, Completed) | (Pending, Error) => true,
            (InProgress, Completed) | (InProgress, Error) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistStep {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Monotone per-execution progress tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checklist {
    pub total_steps: u32,
    pub current_step: u32,
    pub steps: Vec<ChecklistStep>,
}

impl Checklist {
    /// Build a fresh checklist from step names. Ids are `step_1`, `step_2`, …
    pub fn new(names: &[String]) -> Self {
        let steps = names
            .iter()
            .enumerate()
            .map(|(i, name)| ChecklistStep {
                id: format!("step_{}", i + 1),
                name: name.clone(),
                status: StepStatus::Pending,
                timestamp: None,
                message: None,
            })
            .collect::<Vec<_>>();
        Self {
            total_steps: steps.len() as u32,
            current_step: 0,
            steps,
        }
    }

    /// Apply a status update to one step. Updates are keyed by step id so
    /// repeated writes converge; backward transitions are rejected.
    pub fn apply_update(
        &mut self,
        step_id: &str,
        status: StepStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pos = self
            .steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| Error::NotFound(format!("checklist step '{step_id}'")))?;

        let step = &mut self.steps[pos];
        if !step.status.can_transition(status) {
            return Err(Error::InvalidArgs(format!(
                "step '{step_id}' cannot move from {:?} to {:?}",
                step.status, status
            )));
        }
        if step.status != status {
            step.status = status;
            step.timestamp = Some(now);
        }
        if let Some(msg) = message {
            step.message = Some(msg);
        }
        if status == StepStatus::InProgress {
            self.current_step = pos as u32 + 1;
        }
        Ok(())
    }

    pub fn completed_count(&self) -> u32 {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count() as u32
    }

    pub fn errored_count(&self) -> u32 {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Error)
            .count() as u32
    }

    /// Classify a finished run from the step outcomes.
    pub fn classify(&self) -> ExecutionStatus {
        let completed = self.completed_count();
        let errored = self.errored_count();
        if errored == 0 && completed == self.total_steps {
            ExecutionStatus::Completed
        } else if completed == 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Partial
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Long-process tool envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LptOutcome {
    Completed,
    Failed,
    Partial,
}

/// Terminal result a worker reports for an LPT job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LptResponse {
    pub status: LptOutcome,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl LptResponse {
    /// Human-readable one-liner for checklist messages and continuation
    /// prompts.
    pub fn summary_text(&self) -> String {
        match self.status {
            LptOutcome::Completed | LptOutcome::Partial => self
                .result
                .as_ref()
                .and_then(|r| r.get("summary"))
                .and_then(|s| s.as_str())
                .map(String::from)
                .unwrap_or_else(|| "job finished".into()),
            LptOutcome::Failed => self
                .error
                .clone()
                .unwrap_or_else(|| "job failed without detail".into()),
        }
    }
}

/// Routing metadata carried through the worker round-trip so the callback
/// can locate the paused workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traceability {
    pub thread_key: String,
    #[serde(default)]
    pub thread_name: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlan>,
    pub initiated_at: DateTime<Utc>,
    pub source: String,
}

/// The one JSON envelope used both for worker submission and (echoed back,
/// with `response` filled in) for the callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LptEnvelope {
    pub collection_name: String,
    pub user_id: String,
    pub client_uuid: String,
    pub mandates_path: String,
    pub batch_id: String,
    #[serde(default)]
    pub jobs_data: Vec<serde_json::Value>,
    #[serde(default)]
    pub settings: Vec<serde_json::Value>,
    pub traceability: Traceability,
    pub pub_sub_id: String,
    #[serde(default)]
    pub start_instructions: Option<String>,
    #[serde(default)]
    pub response: Option<LptResponse>,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs_url: Option<String>,
}

/// Submitted long-process job as tracked on the owning execution. The
/// `response` field doubles as the callback idempotency ledger: once a
/// terminal response is recorded, later callbacks for the same `lpt_id`
/// are no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LptHandle {
    pub lpt_id: String,
    pub task_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub step_id: Option<String>,
    pub submit: LptEnvelope,
    #[serde(default)]
    pub response: Option<LptResponse>,
}

impl LptHandle {
    pub fn is_settled(&self) -> bool {
        self.response.is_some()
    }
}
