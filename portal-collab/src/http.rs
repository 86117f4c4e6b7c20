//! REST query API over recorded collaboration data.
//!
//! | Method | Path                       | Returns                      |
//! |--------|----------------------------|------------------------------|
//! | GET    | `/rooms/{room}/activity`   | newest-first activity (50)   |
//! | GET    | `/rooms/{room}/history`    | change history (50)          |
//! | GET    | `/rooms/{room}/chat`       | chat transcript (100)        |
//! | GET    | `/rooms/{room}/stats`      | [`RoomStats`]                |
//! | DELETE | `/rooms/{room}`            | 204, admin only              |
//!
//! Every route needs `Authorization: Bearer <token>` and access to the room.
//! Bodies use the `{ "data": ... }` envelope; errors are `{ "error", "code" }`.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::auth::{bearer_token, Identity, TokenVerifier};
use crate::error::CollabError;
use crate::recorder::{ActivityEntry, ChatMessage, HistoryEntry};
use crate::session::{CollabService, RoomStats, DEFAULT_ACTIVITY_LIMIT};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_CHAT_LIMIT: usize = 100;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CollabService>,
    pub verifier: TokenVerifier,
}

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Collab(#[from] CollabError),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Collab(err) => {
                let status = match err {
                    CollabError::AuthRejected(_) => StatusCode::UNAUTHORIZED,
                    CollabError::AccessDenied { .. } => StatusCode::FORBIDDEN,
                    CollabError::LockConflict { .. }
                    | CollabError::NotJoined { .. }
                    | CollabError::RoomFull { .. } => StatusCode::CONFLICT,
                    CollabError::Malformed(_) => StatusCode::BAD_REQUEST,
                    CollabError::Persistence(msg) => {
                        log::error!("Persistence error in query API: {msg}");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.code(), err.to_string())
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

/// Caller identity from a bearer token in the `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CollabError::AuthRejected("missing Authorization header".into()))?;
        let token = bearer_token(header).ok_or_else(|| {
            CollabError::AuthRejected("expected Authorization: Bearer <token>".into())
        })?;
        Ok(AuthUser(state.verifier.verify(token)?))
    }
}

fn check_access(state: &AppState, identity: &Identity, room_id: &str) -> ApiResult<()> {
    if state.service.policy().can_access(identity, room_id) {
        Ok(())
    } else {
        Err(CollabError::AccessDenied {
            room_id: room_id.to_string(),
        }
        .into())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/{room_id}", axum::routing::delete(clear_room))
        .route("/rooms/{room_id}/activity", get(activity))
        .route("/rooms/{room_id}/history", get(history))
        .route("/rooms/{room_id}/chat", get(chat))
        .route("/rooms/{room_id}/stats", get(stats))
        .with_state(state)
}

/// Serve the query API until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Query API listening on {addr}");
    }
    axum::serve(listener, router(state)).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn activity(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Json<DataResponse<Vec<ActivityEntry>>>> {
    check_access(&state, &user, &room_id)?;
    let data = state
        .service
        .recorder()
        .read_activity(&room_id, q.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT))
        .await;
    Ok(Json(DataResponse { data }))
}

async fn history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Json<DataResponse<Vec<HistoryEntry>>>> {
    check_access(&state, &user, &room_id)?;
    let data = state
        .service
        .recorder()
        .read_history(&room_id, q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await;
    Ok(Json(DataResponse { data }))
}

async fn chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Json<DataResponse<Vec<ChatMessage>>>> {
    check_access(&state, &user, &room_id)?;
    let data = state
        .service
        .recorder()
        .read_chat(&room_id, q.limit.unwrap_or(DEFAULT_CHAT_LIMIT))
        .await;
    Ok(Json(DataResponse { data }))
}

async fn stats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<String>,
) -> ApiResult<Json<DataResponse<RoomStats>>> {
    check_access(&state, &user, &room_id)?;
    let data = state.service.stats(&room_id).await;
    Ok(Json(DataResponse { data }))
}

async fn clear_room(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<String>,
) -> ApiResult<StatusCode> {
    check_access(&state, &user, &room_id)?;
    if !state.service.policy().is_admin(&user) {
        log::warn!("User {} tried to clear room {room_id} without admin role", user.user_id);
        return Err(ApiError::Forbidden("Admin role required".into()));
    }
    state.service.clear_room(&room_id).await;
    Ok(StatusCode::NO_CONTENT)
}
