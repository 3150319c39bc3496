//! The persistent data layout.
//!
//! - Task:             `{mandate_path}/tasks/{task_id}`
//! - Execution:        `{mandate_path}/tasks/{task_id}/executions/{execution_id}`
//! - Scheduler index:  `scheduled_tasks/{slug(mandate_path)_task_id}`
//! - Thread history:   `{company_id}/chats/{thread_key}/messages/{message_id}`

pub fn mandate_doc(mandate_path: &str) -> String {
    mandate_path.trim_matches('/').to_string()
}

/// Per-(user, company) profile document: mandate path, locale, DMS system,
/// job metrics. Fetched once per session materialization.
pub fn user_company_doc(user_id: &str, company_id: &str) -> String {
    format!("users/{user_id}/companies/{company_id}")
}

pub fn task_doc(mandate_path: &str, task_id: &str) -> String {
    format!("{}/tasks/{task_id}", mandate_path.trim_matches('/'))
}

pub fn tasks_collection(mandate_path: &str) -> String {
    format!("{}/tasks", mandate_path.trim_matches('/'))
}

pub fn execution_doc(mandate_path: &str, task_id: &str, execution_id: &str) -> String {
    format!(
        "{}/tasks/{task_id}/executions/{execution_id}",
        mandate_path.trim_matches('/')
    )
}

pub fn executions_collection(mandate_path: &str, task_id: &str) -> String {
    format!("{}/tasks/{task_id}/executions", mandate_path.trim_matches('/'))
}

pub const SCHEDULER_INDEX: &str = "scheduled_tasks";

/// Index document id: slugified mandate path joined to the task id. Stable
/// under re-slugging so create/delete always address the same entry.
pub fn index_id(mandate_path: &str, task_id: &str) -> String {
    format!("{}_{task_id}", slug(mandate_path))
}

pub fn index_doc(mandate_path: &str, task_id: &str) -> String {
    format!("{SCHEDULER_INDEX}/{}", index_id(mandate_path, task_id))
}

pub fn thread_doc(company_id: &str, thread_key: &str) -> String {
    format!("{company_id}/chats/{thread_key}")
}

pub fn messages_collection(company_id: &str, thread_key: &str) -> String {
    format!("{company_id}/chats/{thread_key}/messages")
}

pub fn message_doc(company_id: &str, thread_key: &str, message_id: i64) -> String {
    format!("{company_id}/chats/{thread_key}/messages/{message_id}")
}

/// Lowercase alphanumerics; every other run of characters collapses to a
/// single `-`.
pub fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true; // suppress a leading dash
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
