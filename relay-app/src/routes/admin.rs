//! Admin observer socket.
//!
//! Subscribers get the session list on connect and again on every store
//! mutation; an explicit clear is announced separately before the refreshed
//! list. The socket also accepts `getSessions` and `clearSession` commands,
//! mirroring the admin panel's needs. Rendering lives entirely on the
//! client; this route only moves events.

use crate::server::AppState;
use crate::session::SessionEvent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

pub fn router() -> Router {
    Router::new().route("/admin/ws", get(ws_upgrade))
}

async fn ws_upgrade(
    Extension(state): Extension<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let mut events = state.store.subscribe();
    let (mut sender, mut receiver) = socket.split();

    if sender
        .send(Message::Text(sessions_payload(&state).into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::SessionCleared { session_id }) => {
                    let payload = serde_json::json!({
                        "type": "session_cleared",
                        "sessionId": session_id,
                    });
                    if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Ok(SessionEvent::SessionsChanged) => {
                    if sender.send(Message::Text(sessions_payload(&state).into())).await.is_err() {
                        break;
                    }
                }
                // Missed events are fine; the full list resyncs.
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if sender.send(Message::Text(sessions_payload(&state).into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = receiver.next() => {
                let Some(Ok(Message::Text(text))) = msg else {
                    if matches!(msg, Some(Ok(_))) {
                        continue;
                    }
                    break;
                };
                if let Err(e) = handle_command(&state, &mut sender, &text).await {
                    tracing::debug!(error = %e, "admin socket closed mid-command");
                    break;
                }
            }
        }
    }
}

async fn handle_command(
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    text: &str,
) -> anyhow::Result<()> {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%e, "admin socket received invalid json");
            return Ok(());
        }
    };
    match parsed.get("type").and_then(|v| v.as_str()) {
        Some("getSessions") => {
            sender
                .send(Message::Text(sessions_payload(state).into()))
                .await
                .map_err(|_| anyhow::anyhow!("socket closed"))?;
        }
        Some("clearSession") => {
            if let Some(session_id) = parsed.get("sessionId").and_then(|v| v.as_str()) {
                // The store's broadcast fans the result out to every
                // subscriber, this socket included.
                state.store.clear(session_id);
            }
        }
        other => {
            tracing::debug!(message_type = ?other, "admin socket ignoring message");
        }
    }
    Ok(())
}

fn sessions_payload(state: &Arc<AppState>) -> String {
    serde_json::json!({
        "type": "sessions",
        "sessions": state.store.list(),
    })
    .to_string()
}
