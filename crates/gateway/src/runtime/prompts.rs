//! System-prompt builders, one per chat mode, plus the utility prompts
//! used by resummarization and timezone resolution.

use ma_domain::chat::ChatMode;
use ma_domain::task::{ExecutionReport, LptOutcome, Mission};
use ma_sessions::SessionState;

const GENERAL_PERSONA: &str = "You are Maestro, the operations assistant for a fiduciary \
back office. You help the user run their mandates: document routing, accounts-payable \
bookkeeping, bank reconciliation, and HR administration. Be precise, cite concrete \
numbers from tool results, and never invent document or transaction data.";

const ONBOARDING_PERSONA: &str = "You are Maestro guiding a new user through onboarding: \
connecting their document management system, verifying mandate data, and scheduling \
their first recurring tasks. Keep each answer focused on the next concrete step.";

const APBOOKKEEPER_PERSONA: &str = "You are the AP bookkeeping specialist. You discuss \
supplier invoices, payment proposals, and posting questions for this mandate. You have \
no tools in this role; answer from the conversation and ask the user to switch to the \
general assistant for actions.";

const ROUTER_PERSONA: &str = "You are the document routing specialist. You discuss inbox \
triage, routing rules, and document classification for this mandate. You have no tools \
in this role; answer from the conversation and ask the user to switch to the general \
assistant for actions.";

const BANKER_PERSONA: &str = "You are the bank reconciliation specialist. You discuss \
bank statements, matching rules, and open reconciliation items for this mandate. You \
have no tools in this role; answer from the conversation and ask the user to switch to \
the general assistant for actions.";

const TASK_EXECUTION_HEADER: &str = "You are Maestro running an autonomous task for this \
mandate. Work the mission plan step by step.\n\
- First call CREATE_CHECKLIST with the plan's steps.\n\
- Mark a step in_progress before working on it and completed or error when done, via UPDATE_STEP.\n\
- Long-process tools return {status: \"submitted\"}; the run pauses until the worker \
reports back, then you continue.\n\
- When the mission is finished (or cannot proceed), call TERMINATE_TASK.";

const LPT_CALLBACK_HEADER: &str = "A long-process worker has reported back on a job you \
submitted earlier. FIRST update the matching checklist step with UPDATE_STEP, quoting \
the worker's result. THEN decide: continue with the next step of the plan, adjust the \
plan, or call TERMINATE_TASK if the mission is finished or unrecoverable.";

/// Build the system prompt for a thread.
pub fn build_system_prompt(
    mode: ChatMode,
    session: &SessionState,
    mission: Option<&Mission>,
    last_report: Option<&ExecutionReport>,
) -> String {
    let persona = match mode {
        ChatMode::GeneralChat | ChatMode::AccountingChat => GENERAL_PERSONA,
        ChatMode::OnboardingChat => ONBOARDING_PERSONA,
        ChatMode::ApBookkeeperChat => APBOOKKEEPER_PERSONA,
        ChatMode::RouterChat => ROUTER_PERSONA,
        ChatMode::BankerChat => BANKER_PERSONA,
        ChatMode::TaskExecution => TASK_EXECUTION_HEADER,
        ChatMode::LptCallback => LPT_CALLBACK_HEADER,
    };

    let mut prompt = String::from(persona);

    prompt.push_str("\n\n## Mandate context\n");
    prompt.push_str(&format!("- Mandate: {}\n", session.mandate_path));
    if let Some(country) = &session.country {
        prompt.push_str(&format!("- Country: {country}\n"));
    }
    if let Some(tz) = &session.timezone {
        prompt.push_str(&format!("- Timezone: {tz}\n"));
    }
    if let Some(lang) = &session.user_language {
        prompt.push_str(&format!("- Answer in the user's language: {lang}\n"));
    }
    if let Some(dms) = &session.dms_system {
        prompt.push_str(&format!("- Document management system: {dms}\n"));
    }

    if let Some(mission) = mission {
        prompt.push_str(&format!(
            "\n## Mission\n{}\n\n{}\n\n### Plan\n{}\n",
            mission.title, mission.description, mission.plan
        ));
    }

    if let Some(report) = last_report {
        prompt.push_str(&format!(
            "\n## Previous run\nStatus {:?}: {} ({}/{} steps completed, {} errored)\n",
            report.status,
            report.summary,
            report.steps_completed,
            report.steps_total,
            report.steps_errored,
        ));
    }

    prompt
}

/// The one-shot summarization instruction. The reply becomes the new
/// compressed prompt prefix for the thread.
pub fn summarization_instruction() -> &'static str {
    "Summarize the conversation so far for your own future reference. Keep every fact \
     needed to continue the work: mandate identifiers, amounts, document references, \
     decisions taken, open questions, and the current state of any checklist or \
     submitted job. Reply with the summary only."
}

/// One-shot question used when a mandate carries no timezone. The answer
/// is persisted on the mandate.
pub fn timezone_question(country: &str) -> String {
    format!(
        "Reply with only the IANA timezone identifier (e.g. Europe/Zurich) most \
         appropriate for a business located in this country: {country}"
    )
}

/// The continuation message injected when a workflow resumes after an LPT
/// callback (or a watchdog-forced timeout).
pub fn lpt_continuation(lpt_id: &str, status: LptOutcome, summary: &str) -> String {
    let outcome = match status {
        LptOutcome::Completed => "completed",
        LptOutcome::Failed => "FAILED",
        LptOutcome::Partial => "partially completed",
    };
    format!(
        "Worker callback for job {lpt_id}: the job {outcome}. Result: {summary}\n\
         Update the checklist step for this job first (UPDATE_STEP), then continue, \
         adjust the plan, or terminate."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ma_domain::task::ExecutionStatus;

    fn session() -> SessionState {
        SessionState {
            user_id: "u1".into(),
            company_id: "acme".into(),
            mandate_path: "clients/acme/companies/acme-ag".into(),
            country: Some("CH".into()),
            timezone: Some("Europe/Zurich".into()),
            user_language: Some("fr".into()),
            dms_system: None,
            job_metrics: serde_json::Value::Null,
            active_threads: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn general_prompt_carries_mandate_context() {
        let p = build_system_prompt(ChatMode::GeneralChat, &session(), None, None);
        assert!(p.contains("clients/acme/companies/acme-ag"));
        assert!(p.contains("fr"));
        assert!(!p.contains("## Mission"));
    }

    #[test]
    fn task_execution_prompt_includes_mission_and_report() {
        let mission = Mission {
            title: "Monthly reconciliation".into(),
            description: "Reconcile all bank accounts".into(),
            plan: "1. fetch statements\n2. reconcile\n3. report".into(),
        };
        let report = ExecutionReport {
            execution_id: "abc".into(),
            status: ExecutionStatus::Partial,
            summary: "2 of 3 steps done".into(),
            steps_total: 3,
            steps_completed: 2,
            steps_errored: 1,
            finished_at: Utc::now(),
        };
        let p = build_system_prompt(
            ChatMode::TaskExecution,
            &session(),
            Some(&mission),
            Some(&report),
        );
        assert!(p.contains("CREATE_CHECKLIST"));
        assert!(p.contains("Monthly reconciliation"));
        assert!(p.contains("## Previous run"));
        assert!(p.contains("2 of 3 steps done"));
    }

    #[test]
    fn callback_prompt_orders_checklist_first() {
        let p = build_system_prompt(ChatMode::LptCallback, &session(), None, None);
        assert!(p.contains("FIRST update the matching checklist step"));
    }

    #[test]
    fn continuation_quotes_summary() {
        let msg = lpt_continuation("b-1", LptOutcome::Completed, "42 transactions reconciled");
        assert!(msg.contains("42 transactions reconciled"));
        assert!(msg.contains("UPDATE_STEP"));
    }
}
