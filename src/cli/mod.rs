//! Command-line interface.
//!
//! Every command except `serve` and `config` opens the configured storage
//! directly, performs one operation and exits.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;
use crate::services::Scheduler;
use commands::{agent::AgentArgs, config::ConfigArgs, serve::ServeArgs, task::TaskArgs, ticket::TicketArgs};

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(about = "Dependency-aware task scheduler for agent swarms", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Extra config file merged over .taskmesh/config.yaml
    #[arg(short, long, global = true, env = "TASKMESH_CONFIG_FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API and the heartbeat sweeper
    Serve(ServeArgs),
    /// Ticket management
    Ticket(TicketArgs),
    /// Task management
    Task(TaskArgs),
    /// Agent inspection
    Agent(AgentArgs),
    /// Queue, merge and circuit overview
    Status,
    /// Show or validate the effective configuration
    Config(ConfigArgs),
}

impl Commands {
    /// Long-running commands log at the configured level; one-shot commands stay quiet.
    pub const fn is_long_running(&self) -> bool {
        matches!(self, Self::Serve(_))
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    ConfigLoader::new()
        .with_file(path)
        .load()
        .context("Failed to load configuration")
}

pub async fn open_scheduler(config: Config) -> Result<Scheduler> {
    Scheduler::from_config(config)
        .await
        .context("Failed to open scheduler storage")
}

/// Print the error chain and exit non-zero.
pub fn handle_error(err: &anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
        let body = serde_json::json!({ "error": err.to_string(), "causes": chain });
        eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1)
}
