//! HTTP surface: the RPC gateway, the WebSocket hub, the worker callback
//! endpoint, and the health probe.

pub mod auth;
pub mod callback;
pub mod rpc;
pub mod ws;

use axum::extract::State;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full API router.
///
/// `/rpc` sits behind the frontend bearer token; `/lpt/callback` checks
/// the worker token inside its handler; `/healthz` and `/ws` are open.
pub fn router(state: AppState) -> Router<AppState> {
    let open = Router::new()
        .route("/healthz", get(health))
        .route("/ws", get(ws::ws_handler))
        .route("/lpt/callback", post(callback::lpt_callback));

    let protected = Router::new()
        .route("/rpc", post(rpc::rpc))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_auth,
        ));

    open.merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Liveness/readiness probe. Store reachability is reported, not fatal:
/// the service degrades rather than flaps.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let probe_key = "health:probe";
    let store_ok = state.store.set(probe_key, "1", Some(10)).await.is_ok();
    Json(serde_json::json!({
        "status": "ok",
        "store": if store_ok { "up" } else { "degraded" },
        "brains": state.brains.len(),
        "ws_channels": state.presence.local_channels(),
    }))
}
