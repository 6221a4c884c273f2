//! taskmesh CLI entry point.

use anyhow::Result;
use clap::Parser;

use taskmesh::cli::{commands, handle_error, load_config, Cli, Commands};
use taskmesh::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli.command, cli.config.as_deref(), cli.json).await {
        handle_error(&err, cli.json);
    }
}

async fn run(command: Commands, config_path: Option<&std::path::Path>, json: bool) -> Result<()> {
    if let Commands::Config(args) = &command {
        return commands::config::execute(args, config_path, json);
    }

    let config = load_config(config_path)?;
    let mut log_config = LogConfig::from_settings(&config.logging).map_err(anyhow::Error::msg)?;
    if !command.is_long_running() {
        log_config = log_config.with_level("warn");
    }
    let _logger = LoggerImpl::init(&log_config)?;

    match command {
        Commands::Serve(args) => commands::serve::execute(args, config).await,
        Commands::Ticket(args) => commands::ticket::execute(args, config, json).await,
        Commands::Task(args) => commands::task::execute(args, config, json).await,
        Commands::Agent(args) => commands::agent::execute(args, config, json).await,
        Commands::Status => commands::status::execute(config, json).await,
        Commands::Config(_) => Ok(()),
    }
}
