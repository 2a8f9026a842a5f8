mod config;
mod logging;
mod server;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use roomlink_sfu::{LocalEngine, RoomRegistry, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::server::RoomLinkServer;

/// SFU signaling coordinator
#[derive(Debug, Parser)]
#[command(name = "roomlink", version, about)]
struct Cli {
    /// Path to a configuration file (toml, yaml or json)
    #[arg(short, long, env = "ROOMLINK_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(cli.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        );
    }

    // 3. Initialize logging
    let _log_guard = logging::init_logging(&config.logging)?;
    info!("RoomLink server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Start media workers
    let sfu_config = Arc::new(config.sfu.clone());
    let pool = WorkerPool::start(Arc::new(LocalEngine::new()), &sfu_config).await?;
    info!(workers = pool.len(), "Media worker pool started");

    // 5. Room registry and server
    let registry = RoomRegistry::new(sfu_config, pool);
    let server = RoomLinkServer::new(config, registry, CancellationToken::new());
    server.start().await
}
