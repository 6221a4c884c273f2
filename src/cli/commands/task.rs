//! Task CLI commands.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use super::ticket::parse_priority;
use crate::cli::output::{format_time, list_table, output, render_list, short_id, truncate, CommandOutput};
use crate::domain::models::{CancelOutcome, Config, Task, TaskStatus};
use crate::domain::ports::TaskFilter;
use crate::services::NewTask;

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a task under a ticket
    Create {
        /// Owning ticket ID
        ticket_id: Uuid,
        /// Task description
        description: String,
        /// Task dependencies (comma-separated UUIDs)
        #[arg(short = 'D', long, value_delimiter = ',')]
        depends_on: Vec<Uuid>,
        /// Priority tier (low, medium, high, critical)
        #[arg(short, long)]
        priority: Option<String>,
        /// Deadline as RFC 3339, e.g. 2026-01-31T17:00:00Z
        #[arg(long)]
        deadline: Option<DateTime<Utc>>,
        /// Retry budget; defaults to tasks.default_max_retries
        #[arg(long)]
        max_retries: Option<u32>,
        /// Repeating a key returns the task created with it
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Show details for a specific task
    Show {
        /// Task ID
        task_id: Uuid,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
        /// Filter by ticket
        #[arg(short, long)]
        ticket: Option<Uuid>,
        /// Maximum number of tasks to display
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Cancel a task; held tasks are flagged for their agent to stop
    Cancel {
        /// Task ID
        task_id: Uuid,
        /// Reason recorded on the task
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Retry a failed task with a fresh retry budget
    Retry {
        /// Task ID
        task_id: Uuid,
    },
}

#[derive(Debug, Serialize)]
pub struct TaskListOutput {
    pub tasks: Vec<Task>,
    pub total: usize,
}

impl CommandOutput for TaskListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "status", "priority", "agent", "retries", "description"]);
        for task in &self.tasks {
            table.add_row(vec![
                short_id(&task.id),
                task.status.to_string(),
                task.priority.as_str().to_string(),
                task.claimed_by.clone().unwrap_or_else(|| "-".to_string()),
                format!("{}/{}", task.retry_count, task.max_retries),
                truncate(&task.description, 48),
            ]);
        }
        render_list("task", &table, self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct TaskDetailOutput {
    pub task: Task,
}

impl CommandOutput for TaskDetailOutput {
    fn to_human(&self) -> String {
        let task = &self.task;
        let mut lines = vec![
            "Task Details:".to_string(),
            format!("  ID: {}", task.id),
            format!("  Ticket: {}", task.ticket_id),
            format!("  Status: {}", task.status),
            format!("  Description: {}", task.description),
            format!("  Priority: {}", task.priority.as_str()),
            format!("  Retries: {}/{}", task.retry_count, task.max_retries),
            format!("  Attempts: {}", task.attempts),
            format!("  Created at: {}", format_time(&task.created_at)),
        ];
        if let Some(agent) = &task.claimed_by {
            lines.push(format!("  Claimed by: {agent}"));
        }
        if let Some(deadline) = &task.deadline {
            lines.push(format!("  Deadline: {}", format_time(deadline)));
        }
        if let Some(completed_at) = &task.completed_at {
            lines.push(format!("  Completed at: {}", format_time(completed_at)));
        }
        if task.cancel_requested {
            lines.push("  Cancel requested: yes".to_string());
        }
        if let Some(err) = &task.last_error {
            lines.push(format!("  Last error: {err}"));
        }
        if let Some(artifact) = &task.artifact {
            lines.push(format!("  Artifact: {} -> {}", artifact.produced_ref, artifact.base_ref));
        }
        if !task.depends_on.is_empty() {
            lines.push("  Dependencies:".to_string());
            for dep in &task.depends_on {
                lines.push(format!("    - {dep}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TaskActionOutput {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub message: String,
}

impl CommandOutput for TaskActionOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

pub async fn execute(args: TaskArgs, config: Config, json_mode: bool) -> Result<()> {
    let scheduler = crate::cli::open_scheduler(config).await?;
    let queue = scheduler.queue();

    match args.command {
        TaskCommands::Create {
            ticket_id,
            description,
            depends_on,
            priority,
            deadline,
            max_retries,
            idempotency_key,
        } => {
            let new = NewTask {
                ticket_id,
                description,
                depends_on,
                priority: priority.as_deref().map(parse_priority).transpose()?,
                deadline,
                max_retries,
                idempotency_key,
            };
            let task = queue.create_task(new).await.context("Failed to create task")?;
            let out = TaskActionOutput {
                task_id: task.id,
                status: task.status,
                message: format!("Task created: {} ({})", task.id, task.status),
            };
            output(&out, json_mode);
        }
        TaskCommands::Show { task_id } => {
            let task = queue.get(task_id).await.context("Failed to retrieve task")?;
            output(&TaskDetailOutput { task }, json_mode);
        }
        TaskCommands::List { status, ticket, limit } => {
            let status = status
                .as_deref()
                .map(|s| TaskStatus::from_str(s).ok_or_else(|| anyhow!("Invalid status: {s}")))
                .transpose()?;
            let tasks = queue
                .list(TaskFilter {
                    status,
                    ticket_id: ticket,
                    claimed_by: None,
                    limit: Some(limit),
                })
                .await
                .context("Failed to list tasks")?;
            let total = tasks.len();
            output(&TaskListOutput { tasks, total }, json_mode);
        }
        TaskCommands::Cancel { task_id, reason } => {
            let outcome = queue.cancel(task_id, reason.as_deref()).await?;
            let task = queue.get(task_id).await?;
            let message = match outcome {
                CancelOutcome::Cancelled => format!("Task {task_id} cancelled"),
                CancelOutcome::Requested => {
                    format!("Cancellation requested; {task_id} stops when its agent next heartbeats")
                }
                CancelOutcome::NoOp => format!("Task {task_id} is already {}", task.status),
            };
            output(
                &TaskActionOutput {
                    task_id,
                    status: task.status,
                    message,
                },
                json_mode,
            );
        }
        TaskCommands::Retry { task_id } => {
            let task = queue.retry(task_id).await.context("Failed to retry task")?;
            output(
                &TaskActionOutput {
                    task_id,
                    status: task.status,
                    message: format!("Task {task_id} requeued as {}", task.status),
                },
                json_mode,
            );
        }
    }
    Ok(())
}
