//! `taskmesh status`

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::output::{list_table, output, short_id, truncate, CommandOutput};
use crate::domain::models::{AgentStatus, Config};
use crate::services::{MergeState, QueueStats};

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub queue: QueueStats,
    pub merges: MergeState,
    pub live_agents: usize,
    pub stale_agents: usize,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let mut counts = list_table(&["status", "count"]);
        for (status, count) in &self.queue.counts {
            counts.add_row(vec![status.to_string(), count.to_string()]);
        }

        let mut lines = vec![
            format!("Queue ({} tasks, {} ready):", self.queue.total, self.queue.ready),
            counts.to_string(),
        ];

        if !self.queue.next_up.is_empty() {
            let mut next = list_table(&["task", "score", "description"]);
            for ranked in &self.queue.next_up {
                next.add_row(vec![
                    short_id(&ranked.task_id),
                    format!("{:.3}", ranked.score),
                    truncate(&ranked.description, 48),
                ]);
            }
            lines.push(format!("\nNext up:\n{next}"));
        }

        if !self.queue.blocked.is_empty() {
            lines.push(format!("\nBlocked: {} task(s)", self.queue.blocked.len()));
        }

        let m = &self.merges.stats;
        lines.push(format!(
            "\nMerges: {} pending, {} merged, {} conflicted, {} resolved, {} abandoned",
            m.pending, m.merged, m.conflicted, m.resolved, m.abandoned
        ));
        for unit in &self.merges.conflicts {
            lines.push(format!(
                "  conflict {} on {}: {}",
                short_id(&unit.id),
                unit.base_ref,
                unit.conflict_details.as_deref().unwrap_or("no details")
            ));
        }

        lines.push(format!(
            "\nAgents: {} live, {} stale",
            self.live_agents, self.stale_agents
        ));
        lines.join("\n")
    }
}

pub async fn execute(config: Config, json_mode: bool) -> Result<()> {
    let scheduler = crate::cli::open_scheduler(config).await?;

    let queue = scheduler
        .queue()
        .stats()
        .await
        .context("Failed to get queue statistics")?;
    let merges = scheduler.merge_state().await.context("Failed to get merge state")?;
    let agents = scheduler.workers().liveness().await?;

    let live_agents = agents
        .iter()
        .filter(|a| matches!(a.agent.status, AgentStatus::Idle | AgentStatus::Busy))
        .count();
    let stale_agents = agents
        .iter()
        .filter(|a| a.agent.status == AgentStatus::Stale)
        .count();

    output(
        &StatusOutput {
            queue,
            merges,
            live_agents,
            stale_agents,
        },
        json_mode,
    );
    Ok(())
}
