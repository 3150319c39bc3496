//! WebSocket hub: `GET /ws?uid&space_code&thread_key`.
//!
//! Each connection subscribes to its thread's pub/sub channel and
//! forwards every published event verbatim. Connections are owned here;
//! the rest of the system only ever asks the presence registry whether a
//! channel has subscribers.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::StreamExt;
use serde::Deserialize;

use ma_store::keys;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub uid: String,
    pub space_code: String,
    pub thread_key: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, query, socket))
}

async fn handle_socket(state: AppState, query: WsQuery, mut socket: WebSocket) {
    let channel = keys::chat_channel(&query.uid, &query.space_code, &query.thread_key);

    let mut sub = match state.store.subscribe(&channel).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(channel, error = %e, "ws subscription failed");
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({ "type": "error", "error": "subscription failed" })
                        .to_string(),
                ))
                .await;
            return;
        }
    };

    state.presence.register(&channel, &query.uid).await;
    tracing::debug!(channel, uid = %query.uid, "ws connected");

    loop {
        tokio::select! {
            published = sub.next() => match published {
                Some(msg) => {
                    if socket.send(Message::Text(msg.payload)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if text == "heartbeat" {
                        state.presence.heartbeat(&query.uid).await;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(channel, error = %e, "ws read error");
                    break;
                }
            },
        }
    }

    state.presence.unregister(&channel).await;
    tracing::debug!(channel, uid = %query.uid, "ws disconnected");
}
