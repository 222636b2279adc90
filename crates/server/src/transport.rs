//! WebSocket transport: one task per connected socket, dispatching the
//! `authenticate` / `join_diagram` / `leave_diagram` / `diagram_change` /
//! `cursor_move` events onto the relevant room, and forwarding that room's
//! broadcast back out — skipping echoes back to their own originator (§6,
//! §8 testable property 10).

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use collab_core::ChangeEvent;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::room::RoomEvent;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
enum ClientMessage {
    Authenticate { user_id: String, username: String },
    JoinDiagram { diagram_id: String },
    LeaveDiagram { diagram_id: String },
    DiagramChange { diagram_id: String, changes: Vec<ChangeEvent> },
    CursorMove { diagram_id: String, x: f64, y: f64 },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(128);

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut user_id: Option<String> = None;
    let mut username: Option<String> = None;
    let mut joined: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(err) => {
                trace!(socket_id = %socket_id, %err, "dropping unparseable message");
                continue;
            }
        };

        match client_msg {
            ClientMessage::Authenticate { user_id: uid, username: uname } => {
                debug!(socket_id = %socket_id, user_id = %uid, "authenticate");
                user_id = Some(uid.clone());
                username = Some(uname.clone());
                let _ = out_tx
                    .send(json_msg("authenticated", None, json!({ "userId": uid, "username": uname })))
                    .await;
            }
            ClientMessage::JoinDiagram { diagram_id } => {
                let (Some(uid), Some(uname)) = (user_id.clone(), username.clone()) else {
                    let _ = out_tx.send(error_msg("must authenticate before joining a diagram")).await;
                    continue;
                };
                state.presence.mark_online(&uid, &socket_id, std::time::Instant::now());
                let _ = state.set_user_online(&uid, true).await;

                let room = state.room(&diagram_id);
                match room.join(uid.clone(), uname, socket_id.clone()).await {
                    Ok(join_result) => {
                        let _ = out_tx
                            .send(json_msg(
                                "participants_updated",
                                Some(&diagram_id),
                                json!({ "participants": join_result.participants }),
                            ))
                            .await;

                        let mut rx = room.subscribe();
                        let forward_tx = out_tx.clone();
                        let forward_diagram_id = diagram_id.clone();
                        let forward_uid = uid.clone();
                        let handle = tokio::spawn(async move {
                            forward_room_events(&mut rx, forward_tx, forward_diagram_id, forward_uid).await;
                        });
                        joined.insert(diagram_id, handle);
                    }
                    Err(err) => {
                        warn!(%err, "room join failed");
                        let _ = out_tx.send(error_msg("room unavailable")).await;
                    }
                }
            }
            ClientMessage::LeaveDiagram { diagram_id } => {
                if let Some(handle) = joined.remove(&diagram_id) {
                    handle.abort();
                }
                let room = state.room(&diagram_id);
                let _ = room.leave(socket_id.clone()).await;
            }
            ClientMessage::DiagramChange { diagram_id, changes } => {
                let (Some(uid), Some(uname)) = (user_id.clone(), username.clone()) else {
                    let _ = out_tx.send(error_msg("must authenticate before sending changes")).await;
                    continue;
                };
                let room = state.room(&diagram_id);
                if let Err(err) = room.apply_change(uid, uname, changes).await {
                    warn!(%err, "failed to apply diagram change");
                }
            }
            ClientMessage::CursorMove { diagram_id, x, y } => {
                let (Some(uid), Some(uname)) = (user_id.clone(), username.clone()) else { continue };
                let room = state.room(&diagram_id);
                let _ = room.cursor_move(uid, uname, x, y).await;
            }
        }
    }

    for (diagram_id, handle) in joined {
        handle.abort();
        let room = state.room(&diagram_id);
        let _ = room.leave(socket_id.clone()).await;
    }
    if let Some(uid) = user_id {
        state.presence.mark_offline_by_socket(&socket_id);
        let _ = state.set_user_online(&uid, false).await;
    }
    writer.abort();
    debug!(socket_id = %socket_id, "socket disconnected");
}

async fn forward_room_events(
    rx: &mut broadcast::Receiver<RoomEvent>,
    out_tx: mpsc::Sender<String>,
    diagram_id: String,
    self_user_id: String,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(text) = render_event(&diagram_id, &self_user_id, event) {
                    if out_tx.send(text).await.is_err() {
                        break;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(diagram_id = %diagram_id, skipped, "room event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn render_event(diagram_id: &str, self_user_id: &str, event: RoomEvent) -> Option<String> {
    match event {
        RoomEvent::UserJoined { user_id, username, timestamp, exclude_user } => {
            excluded(&exclude_user, self_user_id)?;
            Some(json_msg(
                "user_joined",
                Some(diagram_id),
                json!({ "userId": user_id, "username": username, "timestamp": timestamp }),
            ))
        }
        RoomEvent::UserLeft { user_id, .. } => {
            Some(json_msg("user_left", Some(diagram_id), json!({ "userId": user_id })))
        }
        RoomEvent::ParticipantsUpdated { participants } => {
            Some(json_msg("participants_updated", Some(diagram_id), json!({ "participants": participants })))
        }
        RoomEvent::DiagramUpdated { changes, version, user_id, username, timestamp, exclude_user } => {
            excluded(&exclude_user, self_user_id)?;
            Some(json_msg(
                "diagram_updated",
                Some(diagram_id),
                json!({
                    "changes": changes,
                    "version": version,
                    "userId": user_id,
                    "username": username,
                    "timestamp": timestamp,
                }),
            ))
        }
        RoomEvent::CursorUpdated { user_id, username, x, y, timestamp, exclude_user } => {
            excluded(&exclude_user, self_user_id)?;
            Some(json_msg(
                "cursor_updated",
                Some(diagram_id),
                json!({ "userId": user_id, "username": username, "x": x, "y": y, "timestamp": timestamp }),
            ))
        }
    }
}

/// `Some(())` when the event should still be delivered, `None` to suppress
/// the echo back to its own originator.
fn excluded(exclude_user: &Option<String>, self_user_id: &str) -> Option<()> {
    if exclude_user.as_deref() == Some(self_user_id) {
        None
    } else {
        Some(())
    }
}

fn json_msg(kind: &str, diagram_id: Option<&str>, mut payload: Value) -> String {
    payload["type"] = json!(kind);
    if let Some(diagram_id) = diagram_id {
        payload["diagramId"] = json!(diagram_id);
    }
    payload.to_string()
}

fn error_msg(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}
