// Module: http
// axum routes: signaling WebSocket, health probe, room inspection

pub mod error;
pub mod health;
pub mod rooms;
pub mod websocket;

use axum::{routing::get, Router};
use roomlink_sfu::RoomRegistry;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Default upper bound for a single signaling frame
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub max_message_size: usize,
}

impl AppState {
    pub const fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

/// Build the full HTTP router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/ws/{room_id}", get(websocket::room_websocket_handler))
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{room_id}", get(rooms::get_room))
        .merge(health::create_health_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
