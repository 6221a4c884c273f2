//! Configuration CLI commands.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the merged configuration
    Show,
    /// Check the merged configuration and report the first problem
    Validate,
}

#[derive(Debug, Serialize)]
pub struct ConfigShowOutput {
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_default()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigValidateOutput {
    pub valid: bool,
    pub error: Option<String>,
}

impl CommandOutput for ConfigValidateOutput {
    fn to_human(&self) -> String {
        match &self.error {
            None => "Configuration is valid.".to_string(),
            Some(e) => format!("Configuration is invalid: {e}"),
        }
    }
}

/// Runs before logging and storage are set up, so a broken config can still be inspected.
pub fn execute(args: &ConfigArgs, path: Option<&Path>, json_mode: bool) -> Result<()> {
    let loader = ConfigLoader::new().with_file(path);

    match args.command {
        ConfigCommands::Show => {
            let config: Config = loader
                .figment()
                .extract()
                .context("Failed to extract configuration from figment")?;
            output(&ConfigShowOutput { config }, json_mode);
            Ok(())
        }
        ConfigCommands::Validate => {
            let result = loader.load();
            let out = ConfigValidateOutput {
                valid: result.is_ok(),
                error: result.as_ref().err().map(|e| format!("{e:#}")),
            };
            output(&out, json_mode);
            if out.valid {
                Ok(())
            } else {
                anyhow::bail!("configuration validation failed")
            }
        }
    }
}
