//! Per-diagram room actor: the server-side analogue of `ydoc.rs`'s
//! `DocCommand`/`run_doc_manager` pair, except the document owned here is a
//! `collab_core::Engine` instead of a yrs `Doc`. One task per diagram owns
//! the engine exclusively; everything else talks to it over a channel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use collab_core::{ChangeEvent, Element, ElementId, Engine, OpOutcome};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::persistence::{self, Db};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const BROADCAST_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 256;

/// A connected collaborator, as seen by one room. Keyed by `user_id` in the
/// room's roster (not `socket_id`) so a user reconnecting on a new socket
/// before the old one is cleaned up updates its existing entry in place
/// rather than appearing twice (§4.7 `addParticipant`).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub socket_id: String,
    pub joined_at: DateTime<Utc>,
    pub cursor: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct JoinResult {
    pub participants: Vec<Participant>,
    pub version: u64,
}

#[derive(Debug)]
pub enum RoomCommand {
    Join {
        user_id: String,
        username: String,
        socket_id: String,
        reply: oneshot::Sender<JoinResult>,
    },
    Leave {
        socket_id: String,
    },
    DiagramChange {
        changes: Vec<ChangeEvent>,
        user_id: String,
        username: String,
        reply: oneshot::Sender<Vec<OpOutcome>>,
    },
    CursorMove {
        user_id: String,
        username: String,
        x: f64,
        y: f64,
    },
    GetParticipants {
        reply: oneshot::Sender<Vec<Participant>>,
    },
    Sweep,
    Shutdown,
}

/// Broadcast to every subscriber of a room. `exclude_user`, when set, names
/// the user whose own socket task should drop this event rather than echo
/// it back to its originator (§8 testable property 10).
#[derive(Debug, Clone)]
pub enum RoomEvent {
    UserJoined {
        user_id: String,
        username: String,
        timestamp: i64,
        exclude_user: Option<String>,
    },
    UserLeft {
        user_id: String,
        socket_id: String,
    },
    DiagramUpdated {
        changes: Vec<ChangeEvent>,
        version: u64,
        user_id: String,
        username: String,
        timestamp: i64,
        exclude_user: Option<String>,
    },
    CursorUpdated {
        user_id: String,
        username: String,
        x: f64,
        y: f64,
        timestamp: i64,
        exclude_user: Option<String>,
    },
    ParticipantsUpdated {
        participants: Vec<Participant>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room actor has shut down")]
    Gone,
}

impl<T> From<mpsc::error::SendError<T>> for RoomError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        RoomError::Gone
    }
}

impl From<oneshot::error::RecvError> for RoomError {
    fn from(_: oneshot::error::RecvError) -> Self {
        RoomError::Gone
    }
}

#[derive(Clone)]
pub struct RoomHandle {
    pub diagram_id: String,
    cmd_tx: mpsc::Sender<RoomCommand>,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub async fn join(&self, user_id: String, username: String, socket_id: String) -> Result<JoinResult, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::Join { user_id, username, socket_id, reply })
            .await?;
        Ok(rx.await?)
    }

    pub async fn leave(&self, socket_id: String) -> Result<(), RoomError> {
        self.cmd_tx.send(RoomCommand::Leave { socket_id }).await?;
        Ok(())
    }

    pub async fn apply_change(
        &self,
        user_id: String,
        username: String,
        changes: Vec<ChangeEvent>,
    ) -> Result<Vec<OpOutcome>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::DiagramChange { changes, user_id, username, reply })
            .await?;
        Ok(rx.await?)
    }

    pub async fn cursor_move(&self, user_id: String, username: String, x: f64, y: f64) -> Result<(), RoomError> {
        self.cmd_tx
            .send(RoomCommand::CursorMove { user_id, username, x, y })
            .await?;
        Ok(())
    }

    pub async fn participants(&self) -> Result<Vec<Participant>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::GetParticipants { reply }).await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.cmd_tx.send(RoomCommand::Shutdown).await?;
        Ok(())
    }
}

/// A [`LowLevelEditor`] adapter with no real canvas behind it (§1 Non-goals
/// exclude rendering) that only logs what a real renderer would have been
/// asked to do.
pub struct ServerEditor {
    diagram_id: String,
}

impl ServerEditor {
    pub fn new(diagram_id: impl Into<String>) -> Self {
        Self { diagram_id: diagram_id.into() }
    }
}

impl collab_core::LowLevelEditor for ServerEditor {
    fn add_element_raw(&self, element: &Element) {
        trace!(diagram_id = %self.diagram_id, element_id = %element.id, "add_element_raw");
    }

    fn remove_element_raw(&self, id: &ElementId) {
        trace!(diagram_id = %self.diagram_id, element_id = %id, "remove_element_raw");
    }

    fn suspend_render(&self) {
        trace!(diagram_id = %self.diagram_id, "suspend_render");
    }

    fn resume_render(&self) {
        trace!(diagram_id = %self.diagram_id, "resume_render");
    }

    fn refresh_graphics(&self, id: &ElementId) {
        trace!(diagram_id = %self.diagram_id, element_id = %id, "refresh_graphics");
    }

    fn register_graphics(&self, id: &ElementId) {
        trace!(diagram_id = %self.diagram_id, element_id = %id, "register_graphics");
    }

    fn refresh_all_graphics(&self) {
        trace!(diagram_id = %self.diagram_id, "refresh_all_graphics");
    }
}

pub fn spawn_room(diagram_id: String, db: Db) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (events, _rx) = broadcast::channel(BROADCAST_CAPACITY);

    let handle = RoomHandle {
        diagram_id: diagram_id.clone(),
        cmd_tx,
        events: events.clone(),
    };

    tokio::spawn(run_room(diagram_id, db, cmd_rx, events));
    handle
}

/// Persists the room's current roster as a `collaboration_sessions` row,
/// the liveness record `purge_inactive_sessions` sweeps (§3). Best-effort:
/// a failed write is logged, never allowed to wedge the room actor.
async fn persist_roster(
    db: &Db,
    diagram_id: &str,
    session_created_at: DateTime<Utc>,
    participants: &HashMap<String, Participant>,
    is_active: bool,
) {
    let session = persistence::CollaborationSessionRow {
        id: diagram_id.to_string(),
        diagram_id: diagram_id.to_string(),
        participants: participants
            .values()
            .map(|p| persistence::SessionParticipant {
                user_id: p.user_id.clone(),
                socket_id: p.socket_id.clone(),
                joined_at: p.joined_at,
                cursor: p.cursor,
            })
            .collect(),
        is_active,
        created_at: session_created_at,
        updated_at: Utc::now(),
    };

    let db = db.clone();
    let diagram_id = diagram_id.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.lock();
        persistence::upsert_session(&conn, &session)
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%diagram_id, %err, "failed to persist collaboration session roster"),
        Err(err) => warn!(%diagram_id, %err, "db blocking task panicked while persisting roster"),
    }
}

async fn run_room(
    diagram_id: String,
    db: Db,
    mut cmd_rx: mpsc::Receiver<RoomCommand>,
    events: broadcast::Sender<RoomEvent>,
) {
    let mut engine = Engine::new(ServerEditor::new(diagram_id.clone()));
    let mut participants: HashMap<String, Participant> = HashMap::new();
    let mut socket_to_user: HashMap<String, String> = HashMap::new();
    let mut version: u64 = 0;
    let session_created_at = Utc::now();

    let mut sweep_ticker = tokio::time::interval(SWEEP_INTERVAL);
    sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(diagram_id = %diagram_id, "room actor started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RoomCommand::Join { user_id, username, socket_id, reply }) => {
                        if let Some(existing) = participants.get(&user_id) {
                            socket_to_user.remove(&existing.socket_id);
                        }
                        let participant = Participant {
                            user_id: user_id.clone(),
                            username: username.clone(),
                            socket_id: socket_id.clone(),
                            joined_at: Utc::now(),
                            cursor: None,
                        };
                        socket_to_user.insert(socket_id, user_id.clone());
                        participants.insert(user_id.clone(), participant.clone());
                        let snapshot: Vec<Participant> = participants.values().cloned().collect();
                        let _ = reply.send(JoinResult { participants: snapshot.clone(), version });
                        let _ = events.send(RoomEvent::UserJoined {
                            user_id: user_id.clone(),
                            username,
                            timestamp: participant.joined_at.timestamp_millis(),
                            exclude_user: Some(user_id),
                        });
                        let _ = events.send(RoomEvent::ParticipantsUpdated { participants: snapshot });
                        persist_roster(&db, &diagram_id, session_created_at, &participants, true).await;
                    }
                    Some(RoomCommand::Leave { socket_id }) => {
                        if let Some(user_id) = socket_to_user.get(&socket_id).cloned() {
                            // Guard against a stale Leave for an old socket racing a
                            // reconnect that already replaced this user's entry.
                            let still_current = participants
                                .get(&user_id)
                                .is_some_and(|p| p.socket_id == socket_id);
                            if still_current {
                                socket_to_user.remove(&socket_id);
                                if let Some(participant) = participants.remove(&user_id) {
                                    let _ = events.send(RoomEvent::UserLeft {
                                        user_id: participant.user_id,
                                        socket_id: participant.socket_id,
                                    });
                                    let snapshot: Vec<Participant> = participants.values().cloned().collect();
                                    let _ = events.send(RoomEvent::ParticipantsUpdated { participants: snapshot });
                                    persist_roster(&db, &diagram_id, session_created_at, &participants, true).await;
                                }
                            }
                        }
                    }
                    Some(RoomCommand::DiagramChange { changes, user_id, username, reply }) => {
                        let now = Instant::now();
                        let outcomes = engine.apply_remote_changes(changes.clone(), now);
                        version += 1;
                        let _ = reply.send(outcomes);
                        let _ = events.send(RoomEvent::DiagramUpdated {
                            changes,
                            version,
                            user_id: user_id.clone(),
                            username,
                            timestamp: Utc::now().timestamp_millis(),
                            exclude_user: Some(user_id),
                        });
                    }
                    Some(RoomCommand::CursorMove { user_id, username, x, y }) => {
                        if let Some(participant) = participants.get_mut(&user_id) {
                            participant.cursor = Some((x, y));
                        }
                        let _ = events.send(RoomEvent::CursorUpdated {
                            user_id: user_id.clone(),
                            username,
                            x,
                            y,
                            timestamp: Utc::now().timestamp_millis(),
                            exclude_user: Some(user_id),
                        });
                    }
                    Some(RoomCommand::GetParticipants { reply }) => {
                        let _ = reply.send(participants.values().cloned().collect());
                    }
                    Some(RoomCommand::Sweep) | None => {
                        engine.sweep(Instant::now());
                        if cmd.is_none() {
                            break;
                        }
                    }
                    Some(RoomCommand::Shutdown) => break,
                }
            }
            _ = sweep_ticker.tick() => {
                engine.sweep(Instant::now());
            }
        }
    }

    persist_roster(&db, &diagram_id, session_created_at, &HashMap::new(), false).await;
    debug!(diagram_id = %diagram_id, "room actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_db() -> Db {
        let conn = persistence::open(&std::env::temp_dir().join(format!(
            "collab-room-test-{}.db",
            uuid::Uuid::new_v4()
        )))
        .unwrap();
        Arc::new(parking_lot::Mutex::new(conn))
    }

    fn create_change(id: &str, user_id: &str) -> ChangeEvent {
        serde_json::from_value(serde_json::json!({
            "kind": "create",
            "elementId": id,
            "elementType": "Task",
            "x": 10,
            "y": 10,
            "width": 100,
            "height": 80,
            "timestamp": 0,
            "userId": user_id,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn join_then_leave_updates_participants() {
        let handle = spawn_room("d1".into(), test_db());

        let join = handle.join("u1".into(), "Alice".into(), "s1".into()).await.unwrap();
        assert_eq!(join.participants.len(), 1);

        handle.leave("s1".into()).await.unwrap();
        let remaining = handle.participants().await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn rejoin_with_new_socket_updates_entry_in_place() {
        let handle = spawn_room("d1b".into(), test_db());

        handle.join("u1".into(), "Alice".into(), "s1".into()).await.unwrap();
        let rejoined = handle.join("u1".into(), "Alice".into(), "s2".into()).await.unwrap();
        assert_eq!(rejoined.participants.len(), 1);
        assert_eq!(rejoined.participants[0].socket_id, "s2");

        // A stale Leave for the old socket must not evict the new entry.
        handle.leave("s1".into()).await.unwrap();
        let remaining = handle.participants().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].socket_id, "s2");
    }

    #[tokio::test]
    async fn diagram_change_bumps_version_and_broadcasts_with_exclusion() {
        let handle = spawn_room("d2".into(), test_db());
        let mut rx = handle.subscribe();

        handle.join("u1".into(), "Alice".into(), "s1".into()).await.unwrap();
        let _ = rx.recv().await; // UserJoined
        let _ = rx.recv().await; // ParticipantsUpdated

        let change = create_change("e1", "u1");
        let outcomes = handle
            .apply_change("u1".into(), "Alice".into(), vec![change])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);

        let event = rx.recv().await.unwrap();
        match event {
            RoomEvent::DiagramUpdated { version, exclude_user, username, .. } => {
                assert_eq!(version, 1);
                assert_eq!(exclude_user.as_deref(), Some("u1"));
                assert_eq!(username, "Alice");
            }
            other => panic!("expected DiagramUpdated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cursor_move_updates_participant_cursor() {
        let handle = spawn_room("d3".into(), test_db());
        handle.join("u1".into(), "Alice".into(), "s1".into()).await.unwrap();
        handle.cursor_move("u1".into(), "Alice".into(), 4.0, 5.0).await.unwrap();
        let participants = handle.participants().await.unwrap();
        assert_eq!(participants[0].cursor, Some((4.0, 5.0)));
    }
}
