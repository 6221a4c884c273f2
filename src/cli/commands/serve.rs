//! `taskmesh serve`

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use crate::adapters::http::HttpServer;
use crate::cli::open_scheduler;
use crate::domain::models::{Config, StorageBackend};

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Override server.host
    #[arg(long)]
    pub host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Keep all state in memory, ignoring database settings
    #[arg(long)]
    pub memory: bool,
}

impl ServeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.memory {
            config.database.backend = StorageBackend::Memory;
        }
    }
}

pub async fn execute(args: ServeArgs, mut config: Config) -> Result<()> {
    args.apply(&mut config);
    let server_config = config.server.clone();

    let scheduler = Arc::new(open_scheduler(config).await?);
    let sweeper = scheduler.spawn_sweeper();

    let result = HttpServer::new(scheduler)
        .with_config(server_config)
        .serve_with_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    sweeper.shutdown().await;
    info!("taskmesh stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c; shutting down");
        return;
    }
    info!("shutdown requested");
}
