//! The key namespace.
//!
//! Every caller builds store keys through these helpers so the namespace
//! stays consistent across components and instances.

/// Session blob TTL (sliding).
pub const SESSION_TTL_SECS: u64 = 2 * 3600;
/// Chat history TTL (sliding).
pub const HISTORY_TTL_SECS: u64 = 24 * 3600;
/// Scheduler tick lock TTL.
pub const CRON_TICK_LOCK_TTL_SECS: u64 = 300;
/// Wallet lock TTL (fail-open at the call site).
pub const BILLING_BALANCE_LOCK_TTL_SECS: u64 = 120;
/// Session-init dedup lock TTL.
pub const LLM_INIT_TTL_SECS: u64 = 300;
/// Billing catch-up dedup TTL.
pub const BILLING_CATCHUP_TTL_SECS: u64 = 3600;
/// Presence heartbeat TTL.
pub const PRESENCE_TTL_SECS: u64 = 300;

pub fn session_state(user: &str, company: &str) -> String {
    format!("session:{user}:{company}:state")
}

pub fn chat_history(user: &str, company: &str, thread: &str) -> String {
    format!("chat:{user}:{company}:{thread}:history")
}

pub fn cron_tick_lock() -> String {
    "lock:cron:tick".into()
}

pub fn billing_balance_lock(user: &str) -> String {
    format!("lock:billing:balance:{user}")
}

pub fn llm_init(user: &str, company: &str) -> String {
    format!("llm_init:{user}:{company}")
}

pub fn workflow_state(company: &str, thread: &str) -> String {
    format!("workflow_state:{company}:{thread}")
}

/// Pattern matching every paused-workflow marker (watchdog sweep).
pub fn workflow_state_pattern() -> String {
    "workflow_state:*".into()
}

pub fn billing_catchup(user: &str, company: &str) -> String {
    format!("billing:catchup:{user}:{company}")
}

/// Pub/sub channel carrying streaming and checklist events for a thread.
pub fn chat_channel(user: &str, company: &str, thread: &str) -> String {
    format!("chat:{user}:{company}:{thread}")
}

pub fn presence(user: &str) -> String {
    format!("presence:{user}")
}

/// Cross-instance mirror of "somebody holds a live WS on this channel".
pub fn channel_presence(channel: &str) -> String {
    format!("presence:channel:{channel}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_formats() {
        assert_eq!(session_state("u1", "acme"), "session:u1:acme:state");
        assert_eq!(
            chat_history("u1", "acme", "t9"),
            "chat:u1:acme:t9:history"
        );
        assert_eq!(cron_tick_lock(), "lock:cron:tick");
        assert_eq!(billing_balance_lock("u1"), "lock:billing:balance:u1");
        assert_eq!(llm_init("u1", "acme"), "llm_init:u1:acme");
        assert_eq!(workflow_state("acme", "t9"), "workflow_state:acme:t9");
        assert_eq!(billing_catchup("u1", "acme"), "billing:catchup:u1:acme");
        assert_eq!(chat_channel("u1", "acme", "t9"), "chat:u1:acme:t9");
    }

    #[test]
    fn history_key_and_channel_are_distinct() {
        // The history blob must never collide with the pub/sub channel name.
        assert_ne!(
            chat_history("u", "c", "t"),
            chat_channel("u", "c", "t")
        );
    }
}
