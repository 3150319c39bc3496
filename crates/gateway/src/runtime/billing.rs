//! Billing catch-up: settle usage entries that accumulated while the
//! session was cold.
//!
//! Spawned fire-and-forget on session ensure. The catch-up key dedups
//! across callers and instances for an hour; the wallet lock is
//! fail-open — when the store cannot confirm the lock, the catch-up
//! proceeds anyway rather than stranding unsettled usage.

use std::sync::Arc;

use serde_json::json;

use ma_store::{keys, LockGuard};

use crate::state::AppState;

pub fn spawn_catchup(state: &AppState, user: &str, company: &str) {
    let state = state.clone();
    let user = user.to_string();
    let company = company.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_catchup(&state, &user, &company).await {
            tracing::warn!(user, company, error = %e, "billing catch-up failed");
        }
    });
}

async fn run_catchup(state: &AppState, user: &str, company: &str) -> ma_domain::Result<()> {
    if !state
        .store
        .setnx(
            &keys::billing_catchup(user, company),
            &chrono::Utc::now().to_rfc3339(),
            keys::BILLING_CATCHUP_TTL_SECS,
        )
        .await
    {
        return Ok(()); // somebody ran it within the hour
    }

    // Fail-open: proceed without the wallet lock if the store cannot
    // grant it.
    let lock = LockGuard::acquire(
        Arc::clone(&state.store),
        keys::billing_balance_lock(user),
        keys::BILLING_BALANCE_LOCK_TTL_SECS,
    )
    .await;
    if lock.is_none() {
        tracing::warn!(user, "wallet lock unavailable, catching up unlocked");
    }

    let result = settle_pending(state, user, company).await;

    if let Some(lock) = lock {
        lock.release().await;
    }
    result
}

/// Fold `billing.pending` usage entries into `billing.balance` on the
/// mandate document.
async fn settle_pending(state: &AppState, user: &str, company: &str) -> ma_domain::Result<()> {
    let Some(session) = state.sessions.get_user_context(user, company).await else {
        return Ok(());
    };
    let Some(mandate) = state.docs.get_doc(&session.mandate_path).await? else {
        return Ok(());
    };

    let billing = mandate.get("billing").cloned().unwrap_or(json!({}));
    let pending: f64 = billing
        .get("pending")
        .and_then(|p| p.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_f64()).sum())
        .unwrap_or(0.0);
    if pending == 0.0 {
        return Ok(());
    }
    let balance = billing.get("balance").and_then(|v| v.as_f64()).unwrap_or(0.0);

    state
        .docs
        .update_doc(
            &session.mandate_path,
            json!({
                "billing": {
                    "balance": balance + pending,
                    "pending": [],
                    "last_catchup_at": chrono::Utc::now(),
                }
            }),
        )
        .await?;
    tracing::info!(user, company, settled = pending, "billing catch-up settled pending usage");
    Ok(())
}
