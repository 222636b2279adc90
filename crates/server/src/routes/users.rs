use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::ApiError;
use crate::persistence::{self, User};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user))
        .route("/users/{id}", get(get_user))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
}

/// §6 persisted-state constraints: `username` length 3-30, `email`
/// lowercased before storage (uniqueness itself is enforced by the
/// `users.email` UNIQUE index and surfaced as a 409 by `ApiError`'s
/// `rusqlite::Error` conversion).
fn validate_username(username: &str) -> Result<(), ApiError> {
    let len = username.chars().count();
    if !(3..=30).contains(&len) {
        return Err(ApiError::bad_request("username must be between 3 and 30 characters"));
    }
    Ok(())
}

async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<User>, ApiError> {
    validate_username(&body.username)?;

    let now = chrono::Utc::now();
    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        username: body.username,
        email: body.email.trim().to_lowercase(),
        avatar: body.avatar,
        is_online: false,
        last_seen: now,
        created_at: now,
        updated_at: now,
    };

    state
        .with_db_blocking({
            let user = user.clone();
            move |conn| persistence::create_user(conn, &user)
        })
        .await?;

    Ok(Json(user))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<User>, ApiError> {
    let user = state.with_db_blocking(move |conn| persistence::get_user(conn, &id)).await?;
    user.map(Json).ok_or_else(|| ApiError::not_found("user not found"))
}
