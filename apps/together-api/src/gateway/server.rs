//! WebSocket upgrade handler and per-member connection loop.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use together_common::id::is_session_id;
use together_common::PositionUpdate;
use tokio::sync::mpsc;

use crate::broadcast::{Frame, MemberConnection};
use crate::error::ApiError;
use crate::AppState;

/// Close codes.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_INTERNAL_ERROR: u16 = 1011;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Frames queued per member. A member further behind than this misses ticks
/// until it catches up; the next frame it gets is the newest snapshot.
const FRAME_BUFFER: usize = 8;

type WsSink = SplitSink<WebSocket, Message>;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/{session_id}/cursors", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_session_id(&session_id) {
        return Err(ApiError::bad_request("Invalid session id"));
    }
    if state.directory.get(&session_id).await?.is_none() {
        return Err(ApiError::not_found("Session not found"));
    }

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, session_id, state)))
}

async fn handle_connection(socket: WebSocket, session_id: String, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);
    let connection: Arc<dyn MemberConnection> = Arc::new(frame_tx);

    let (member_id, broadcast) = match state.registry.join_session(&session_id, connection).await {
        Ok(joined) => joined,
        Err(e) => {
            tracing::warn!(%e, %session_id, "could not join session");
            let _ = send_close(&mut ws_tx, CLOSE_TRY_AGAIN_LATER, "Could not join session").await;
            return;
        }
    };

    tracing::info!(%session_id, member_id, "member connected");

    let mut closed = broadcast.on_session_closed();

    loop {
        tokio::select! {
            // Member reports where its cursor is.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<PositionUpdate>(&text) {
                            Ok(update) => broadcast.position_changed(update.into_state(member_id)).await,
                            Err(e) => {
                                tracing::debug!(%e, %session_id, member_id, "malformed position update dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, %session_id, member_id, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                }
            }

            // Snapshot from the fan-out loop.
            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    // Fan-out loop detached every member; the session is over.
                    let _ = send_close(&mut ws_tx, CLOSE_NORMAL, "Session closed").await;
                    break;
                };
                let json = match serde_json::to_string(frame.as_ref()) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(?e, %session_id, member_id, "failed to encode frame");
                        let _ = send_close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "Internal error").await;
                        break;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            _ = closed.wait() => {
                let _ = send_close(&mut ws_tx, CLOSE_NORMAL, "Session closed").await;
                break;
            }
        }
    }

    broadcast.member_left(member_id).await;

    tracing::info!(%session_id, member_id, "member disconnected");
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
