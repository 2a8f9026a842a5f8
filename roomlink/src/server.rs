//! Server lifecycle management
//!
//! Starts the HTTP/WebSocket signaling server next to the registry's
//! background tasks and tears everything down in order on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomlink_api::http::{create_router, AppState};
use roomlink_sfu::RoomRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// Time the HTTP server gets to finish in-flight requests
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RoomLinkServer {
    config: Config,
    registry: Arc<RoomRegistry>,
    shutdown: CancellationToken,
}

impl RoomLinkServer {
    pub const fn new(config: Config, registry: Arc<RoomRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            registry,
            shutdown,
        }
    }

    /// Serve until a signal arrives or a background task requests shutdown
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting RoomLink server...");

        let cleanup_handle = self.registry.spawn_cleanup_task(self.shutdown.clone());
        let supervisor_handle = self.registry.spawn_worker_supervisor(self.shutdown.clone());
        if supervisor_handle.is_none() {
            warn!("Worker death channel already taken, worker supervision disabled");
        }

        let mut http_handle = self.start_http_server().await?;

        let mut fatal = false;
        tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                fatal = true;
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
            () = self.shutdown.cancelled() => {
                error!("Unrecoverable media worker failure, shutting down");
                fatal = true;
            }
        }

        self.shutdown.cancel();
        if !http_handle.is_finished()
            && tokio::time::timeout(HTTP_DRAIN_TIMEOUT, &mut http_handle)
                .await
                .is_err()
        {
            warn!(
                timeout_secs = HTTP_DRAIN_TIMEOUT.as_secs(),
                "HTTP server did not drain in time, aborting"
            );
            http_handle.abort();
        }

        let _ = cleanup_handle.await;
        if let Some(handle) = supervisor_handle {
            let _ = handle.await;
        }

        info!("Closing all rooms...");
        self.registry.close_all();
        info!("RoomLink server stopped");

        if fatal {
            anyhow::bail!("server terminated abnormally");
        }
        Ok(())
    }

    /// Bind the listener up front so address errors fail startup
    async fn start_http_server(&self) -> anyhow::Result<JoinHandle<()>> {
        let http_addr: SocketAddr = self
            .config
            .http_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{}': {e}", self.config.http_address()))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let state = AppState::new(Arc::clone(&self.registry))
            .with_max_message_size(self.config.server.max_message_size);
        let router = create_router(state);
        let shutdown = self.shutdown.clone();

        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        }))
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
