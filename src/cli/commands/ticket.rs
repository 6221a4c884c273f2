//! Ticket CLI commands.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::cli::output::{format_time, list_table, output, short_id, truncate, CommandOutput};
use crate::domain::models::{Config, Task, TaskPriority, Ticket};
use crate::domain::ports::TaskFilter;

#[derive(Args, Debug)]
pub struct TicketArgs {
    #[command(subcommand)]
    pub command: TicketCommands,
}

#[derive(Subcommand, Debug)]
pub enum TicketCommands {
    /// Create a ticket
    Create {
        /// Ticket title
        title: String,
        /// Priority tier (low, medium, high, critical)
        #[arg(short, long, default_value = "medium")]
        priority: String,
    },
    /// Show a ticket and its tasks
    Show {
        /// Ticket ID
        ticket_id: Uuid,
    },
}

pub(crate) fn parse_priority(s: &str) -> Result<TaskPriority> {
    TaskPriority::from_str(s).ok_or_else(|| anyhow!("Invalid priority: {s}. Use low, medium, high or critical"))
}

#[derive(Debug, Serialize)]
pub struct TicketCreatedOutput {
    pub ticket: Ticket,
}

impl CommandOutput for TicketCreatedOutput {
    fn to_human(&self) -> String {
        format!(
            "Ticket created: {}\n  Title: {}\n  Priority: {}",
            self.ticket.id,
            self.ticket.title,
            self.ticket.priority.as_str()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct TicketDetailOutput {
    pub ticket: Ticket,
    pub tasks: Vec<Task>,
}

impl CommandOutput for TicketDetailOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Ticket: {}", self.ticket.title),
            format!("ID: {}", self.ticket.id),
            format!("Status: {}", self.ticket.status),
            format!("Priority: {}", self.ticket.priority.as_str()),
            format!("Created: {}", format_time(&self.ticket.created_at)),
        ];

        if self.tasks.is_empty() {
            lines.push("\nNo tasks.".to_string());
        } else {
            let mut table = list_table(&["id", "status", "retries", "description"]);
            for task in &self.tasks {
                table.add_row(vec![
                    short_id(&task.id),
                    task.status.to_string(),
                    format!("{}/{}", task.retry_count, task.max_retries),
                    truncate(&task.description, 50),
                ]);
            }
            lines.push(format!("\nTasks ({}):\n{table}", self.tasks.len()));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: TicketArgs, config: Config, json_mode: bool) -> Result<()> {
    let scheduler = crate::cli::open_scheduler(config).await?;

    match args.command {
        TicketCommands::Create { title, priority } => {
            let ticket = scheduler
                .tickets()
                .create(&title, parse_priority(&priority)?)
                .await
                .context("Failed to create ticket")?;
            output(&TicketCreatedOutput { ticket }, json_mode);
        }
        TicketCommands::Show { ticket_id } => {
            let ticket = scheduler
                .tickets()
                .get(ticket_id)
                .await
                .context("Failed to retrieve ticket")?;
            let tasks = scheduler.queue().list(TaskFilter::for_ticket(ticket_id)).await?;
            output(&TicketDetailOutput { ticket, tasks }, json_mode);
        }
    }
    Ok(())
}
