//! Health check endpoints
//!
//! Provides simple health check for monitoring probes.

use axum::{extract::State, response::IntoResponse, routing::get, Router};

use crate::http::{AppResult, AppState};

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Ready while a media worker can take a new room
pub async fn readiness_check(State(state): State<AppState>) -> AppResult<&'static str> {
    state.registry.pool().pick()?;
    Ok("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use roomlink_sfu::{LocalEngine, RoomRegistry, SfuConfig, WorkerPool};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn ready_status(state: AppState) -> StatusCode {
        create_health_router()
            .with_state(state)
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_readiness_follows_worker_liveness() {
        let config = SfuConfig {
            num_workers: 1,
            ..Default::default()
        };
        let engine = Arc::new(LocalEngine::new());
        let pool = WorkerPool::start(engine.clone(), &config).await.unwrap();
        let state = AppState::new(RoomRegistry::new(Arc::new(config), pool));

        assert_eq!(ready_status(state.clone()).await, StatusCode::OK);

        engine.workers()[0].kill("crashed");
        assert_eq!(ready_status(state).await, StatusCode::SERVICE_UNAVAILABLE);
    }
}
