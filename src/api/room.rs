//! Room and session lookup endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection_manager::{ConnectionId, UserId};
use crate::error::AppError;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub members: Vec<UserId>,
    pub total_members: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub active_at: DateTime<Utc>,
}

/// GET /api/v1/room - Current room members
pub async fn room_members(State(state): State<AppState>) -> Json<RoomResponse> {
    let members = state.hub.rooms.members().await;
    let total_members = members.len();
    Json(RoomResponse {
        members,
        total_members,
    })
}

/// GET /api/v1/sessions/{user_id} - Live session of a user
pub async fn get_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let handle = state
        .hub
        .registry
        .session(&user_id)
        .ok_or_else(|| AppError::NotFound(format!("No session for user '{}'", user_id)))?;

    Ok(Json(SessionResponse {
        user_id,
        connection_id: handle.id,
        remote_addr: handle.remote_addr.map(|addr| addr.to_string()),
        connected_at: handle.connected_at,
        active_at: handle.active_at(),
    }))
}
