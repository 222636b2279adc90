use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified API error type that returns proper HTTP status codes (§7).
pub struct ApiError(pub StatusCode, pub String);

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(StatusCode::CONFLICT, msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, msg.into())
    }
}

/// Maps a `rusqlite` failure to a status code: a UNIQUE/PRIMARY KEY
/// constraint violation is a 409 (§7 duplicate identity), everything else
/// an opaque 500.
impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref sqlite_err, _) = err {
            if sqlite_err.code == rusqlite::ErrorCode::ConstraintViolation {
                return ApiError::conflict(err.to_string());
            }
        }
        ApiError::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = axum::Json(json!({ "error": self.1 }));
        (self.0, body).into_response()
    }
}
