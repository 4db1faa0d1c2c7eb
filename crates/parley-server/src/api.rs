//! HTTP endpoints next to the WebSocket: presence and conversation history.

use crate::handlers::AppState;
use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{ArchiveError, AuthError, IdentityVerifier, UserId};
use parley_protocol::ChatMessage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid bearer token.
    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    /// The server keeps no history.
    #[error("Message history is disabled")]
    ArchiveDisabled,

    /// The archive failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::ArchiveDisabled => StatusCode::NOT_FOUND,
            ApiError::Archive(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.to_string())
    }
}

/// JSON error body used by every refused request.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Extract the token from an `Authorization: Bearer` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let user = state.hub.lifecycle().verifier().verify(bearer_token(headers))?;
    Ok(user)
}

/// Online users.
#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub users: Vec<String>,
    pub count: usize,
}

/// `GET /api/presence`
pub async fn presence_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PresenceResponse>, ApiError> {
    authenticate(&state, &headers)?;

    let users: Vec<String> = state
        .hub
        .registry()
        .snapshot()
        .into_iter()
        .map(UserId::into_string)
        .collect();

    Ok(Json(PresenceResponse {
        count: users.len(),
        users,
    }))
}

/// A conversation with one peer, oldest message first.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub peer: String,
    pub messages: Vec<ChatMessage>,
}

/// `GET /api/messages/:peer`
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let archive = state.archive.as_ref().ok_or(ApiError::ArchiveDisabled)?;

    let messages = archive
        .list_between(&user, &UserId::new(peer.as_str()))
        .await
        .map_err(|e| {
            warn!(user = %user, peer = %peer, error = %e, "History lookup failed");
            e
        })?;
    debug!(user = %user, peer = %peer, count = messages.len(), "History served");

    Ok(Json(HistoryResponse {
        peer,
        messages: messages.iter().map(|m| m.to_wire()).collect(),
    }))
}
