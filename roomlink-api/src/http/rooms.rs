//! Room inspection endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use roomlink_sfu::{RegistryStats, RoomId, RoomStats};
use serde::{Deserialize, Serialize};

use crate::http::{AppError, AppResult, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    #[serde(flatten)]
    pub stats: RoomStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomSummary>,
    pub totals: RegistryStats,
}

/// `GET /api/rooms`
pub async fn list_rooms(State(state): State<AppState>) -> Json<RoomListResponse> {
    let rooms = state
        .registry
        .room_ids()
        .into_iter()
        .filter_map(|room_id| {
            let stats = state.registry.room_stats(&room_id)?;
            Some(RoomSummary { room_id, stats })
        })
        .collect();

    Json(RoomListResponse {
        rooms,
        totals: state.registry.stats(),
    })
}

/// `GET /api/rooms/{room_id}`
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomSummary>> {
    let room_id = RoomId::from(room_id);
    let stats = state
        .registry
        .room_stats(&room_id)
        .ok_or_else(|| AppError::not_found(format!("Room {room_id} not found")))?;
    Ok(Json(RoomSummary { room_id, stats }))
}
