use axum::extract::{Path, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::persistence::{self, Diagram};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/diagrams", post(create_diagram))
        .route("/diagrams/{id}", get(get_diagram))
        .route("/diagrams/{id}", put(update_diagram))
        .route("/diagrams/{id}/collaborators", post(add_collaborator))
        .route("/diagrams/{id}/collaborators/{user_id}", delete(remove_collaborator))
        .route("/diagrams/{id}/participants", get(live_participants))
}

const MAX_TITLE_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiagramRequest {
    pub title: String,
    pub description: Option<String>,
    pub owner: String,
    #[serde(default)]
    pub is_public: bool,
}

/// §6 persisted-state constraints: `title` at most 100 characters,
/// `description` (when present) at most 500.
fn validate_diagram_fields(title: &str, description: &Option<String>) -> Result<(), ApiError> {
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::bad_request("title must be at most 100 characters"));
    }
    if let Some(description) = description {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ApiError::bad_request("description must be at most 500 characters"));
        }
    }
    Ok(())
}

async fn create_diagram(
    State(state): State<AppState>,
    Json(body): Json<CreateDiagramRequest>,
) -> Result<Json<Diagram>, ApiError> {
    validate_diagram_fields(&body.title, &body.description)?;

    let now = chrono::Utc::now();
    let diagram = Diagram {
        id: uuid::Uuid::new_v4().to_string(),
        title: body.title,
        description: body.description,
        bpmn_xml: "{\"elements\":[]}".to_string(),
        owner: body.owner,
        collaborators: Vec::new(),
        is_public: body.is_public,
        version: 1,
        last_modified: now,
        created_at: now,
        updated_at: now,
    };

    state
        .with_db_blocking({
            let diagram = diagram.clone();
            move |conn| persistence::create_diagram(conn, &diagram)
        })
        .await?;

    Ok(Json(diagram))
}

async fn get_diagram(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Diagram>, ApiError> {
    let diagram = state.with_db_blocking(move |conn| persistence::get_diagram(conn, &id)).await?;
    diagram.map(Json).ok_or_else(|| ApiError::not_found("diagram not found"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDiagramRequest {
    pub bpmn_xml: String,
}

async fn update_diagram(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateDiagramRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let version = state
        .with_db_blocking(move |conn| {
            persistence::update_diagram_snapshot(conn, &id, &body.bpmn_xml, chrono::Utc::now())
        })
        .await?;

    Ok(Json(serde_json::json!({ "version": version })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorRequest {
    pub user_id: String,
}

async fn add_collaborator(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CollaboratorRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .with_db_blocking(move |conn| persistence::add_collaborator(conn, &id, &body.user_id))
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn remove_collaborator(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .with_db_blocking(move |conn| persistence::remove_collaborator(conn, &id, &user_id))
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// A live-room participant joined against its persisted user profile (§4.7
/// `getParticipants`: "resolved user profile (username, email, avatar)").
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantWithProfile {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
    pub socket_id: String,
    pub joined_at: DateTime<Utc>,
    pub cursor: Option<(f64, f64)>,
}

/// Live, in-memory participant roster for a diagram's room actor — distinct
/// from the diagram's persisted `collaborators` list, which tracks
/// authorization rather than who is currently connected.
async fn live_participants(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ParticipantWithProfile>>, ApiError> {
    let room = state.room(&id);
    let participants = room.participants().await.map_err(|e| ApiError::internal(e.to_string()))?;

    let user_ids: Vec<String> = participants.iter().map(|p| p.user_id.clone()).collect();
    let users = state
        .with_db_blocking(move |conn| {
            user_ids.iter().map(|user_id| persistence::get_user(conn, user_id)).collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    let resolved = participants
        .into_iter()
        .zip(users)
        .map(|(participant, user)| ParticipantWithProfile {
            user_id: participant.user_id,
            username: participant.username,
            email: user.as_ref().map(|u| u.email.clone()),
            avatar: user.as_ref().and_then(|u| u.avatar.clone()),
            socket_id: participant.socket_id,
            joined_at: participant.joined_at,
            cursor: participant.cursor,
        })
        .collect();

    Ok(Json(resolved))
}
