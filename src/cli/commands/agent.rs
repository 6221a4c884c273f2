//! Agent CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{format_time, list_table, output, render_list, CommandOutput};
use crate::domain::models::Config;
use crate::services::AgentLiveness;

#[derive(Args, Debug)]
pub struct AgentArgs {
    #[command(subcommand)]
    pub command: AgentCommands,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// List agents with their liveness and held tasks
    List,
}

#[derive(Debug, Serialize)]
pub struct AgentListOutput {
    pub agents: Vec<AgentLiveness>,
    pub total: usize,
}

impl CommandOutput for AgentListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["agent", "status", "held", "capacity", "last heartbeat", "lease expires"]);
        for entry in &self.agents {
            table.add_row(vec![
                entry.agent.id.clone(),
                entry.agent.status.to_string(),
                entry.held.len().to_string(),
                entry.agent.capacity.to_string(),
                format_time(&entry.agent.last_heartbeat_at),
                entry
                    .lease_expires_at
                    .as_ref()
                    .map_or_else(|| "-".to_string(), format_time),
            ]);
        }
        render_list("agent", &table, self.total)
    }
}

pub async fn execute(args: AgentArgs, config: Config, json_mode: bool) -> Result<()> {
    let scheduler = crate::cli::open_scheduler(config).await?;

    match args.command {
        AgentCommands::List => {
            let agents = scheduler
                .workers()
                .liveness()
                .await
                .context("Failed to list agents")?;
            let total = agents.len();
            output(&AgentListOutput { agents, total }, json_mode);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Agent;

    #[test]
    fn test_agent_list_output() {
        let agent = Agent::new("agent-1", 2);
        let out = AgentListOutput {
            agents: vec![AgentLiveness {
                agent,
                held: vec![],
                lease_expires_at: None,
            }],
            total: 1,
        };
        let human = out.to_human();
        assert!(human.starts_with("1 agent:"));
        assert!(human.contains("agent-1"));

        let json = out.to_json();
        assert_eq!(json["agents"][0]["id"], "agent-1");
    }
}
