use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::models::{PriorityConfig, Task};

/// Per-term contributions to a task's score, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Priority weight times the tier value
    pub priority: f64,
    /// Age weight times the age normalized against its ceiling
    pub age: f64,
    /// Deadline weight times urgency; zero without a deadline
    pub deadline: f64,
    /// Blocker weight times the normalized count of waiting dependents
    pub dependents: f64,
    /// Subtracted from the sum; grows with each failed attempt
    pub retry_penalty: f64,
    /// Whether the SLA multiplier was applied
    pub sla_boosted: bool,
    /// Whether the starvation floor lifted the score
    pub starvation_floored: bool,
    /// Final score after the boost and floor; higher claims first
    pub total: f64,
}

/// Pure scoring function over a task, its dependent count and a clock reading.
///
/// Score formula:
/// `wp*tier + wa*norm(age) + wd*urgency + wb*norm(dependents) - wr*retry_count`,
/// multiplied by the SLA boost when the deadline is inside the urgency window,
/// and lifted to the starvation floor once the task has waited long enough.
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    config: PriorityConfig,
}

impl Default for PriorityScorer {
    fn default() -> Self {
        Self::new(PriorityConfig::default())
    }
}

#[allow(clippy::cast_precision_loss)]
impl PriorityScorer {
    /// Scorer over the given weights and ceilings.
    pub const fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    /// Weights and ceilings in use.
    pub const fn config(&self) -> &PriorityConfig {
        &self.config
    }

    /// Score of `task` at `now` with `dependents` tasks waiting on it.
    pub fn score(&self, task: &Task, dependents: usize, now: DateTime<Utc>) -> f64 {
        self.breakdown(task, dependents, now).total
    }

    /// Same as [`Self::score`], keeping each weighted term.
    ///
    /// The SLA boost multiplies the whole sum. The starvation floor applies
    /// last, so a floored total can sit above the sum of its terms.
    pub fn breakdown(&self, task: &Task, dependents: usize, now: DateTime<Utc>) -> ScoreBreakdown {
        let w = &self.config.weights;
        let age_secs = task.age_seconds(now);

        let age_norm = if self.config.age_ceiling_secs == 0 {
            1.0
        } else {
            (age_secs / self.config.age_ceiling_secs as f64).min(1.0)
        };
        let dependents_norm = if self.config.blocker_ceiling == 0 {
            0.0
        } else {
            (dependents as f64 / f64::from(self.config.blocker_ceiling)).min(1.0)
        };
        let (urgency, within_window) = self.deadline_urgency(task, now);

        let priority = w.priority * task.priority.weight();
        let age = w.age * age_norm;
        let deadline = w.deadline * urgency;
        let dependents = w.dependents * dependents_norm;
        let retry_penalty = w.retry * f64::from(task.retry_count);

        let mut total = priority + age + deadline + dependents - retry_penalty;
        if within_window {
            total *= self.config.sla_boost_multiplier;
        }

        let mut starvation_floored = false;
        if age_secs >= self.config.starvation_limit_secs as f64 && total < self.config.starvation_floor {
            total = self.config.starvation_floor;
            starvation_floored = true;
        }

        ScoreBreakdown {
            priority,
            age,
            deadline,
            dependents,
            retry_penalty,
            sla_boosted: within_window,
            starvation_floored,
            total,
        }
    }

    /// Urgency in `[0, 1]` plus whether the deadline is inside the SLA window.
    ///
    /// Overdue tasks are fully urgent. Tasks without a deadline contribute nothing.
    fn deadline_urgency(&self, task: &Task, now: DateTime<Utc>) -> (f64, bool) {
        let Some(deadline) = task.deadline else {
            return (0.0, false);
        };
        let window = self.config.sla_urgency_window_secs as f64;
        let slack = ((deadline - now).num_milliseconds() as f64 / 1000.0).max(0.0);
        let urgency = if window + slack == 0.0 {
            1.0
        } else {
            window / (window + slack)
        };
        (urgency, slack <= window)
    }

    /// Order tasks best-first. Equal scores fall back to creation order.
    pub fn rank<'a>(
        &self,
        tasks: &'a [Task],
        dependents: &HashMap<Uuid, usize>,
        now: DateTime<Utc>,
    ) -> Vec<(&'a Task, f64)> {
        let mut scored: Vec<(&Task, f64)> = tasks
            .iter()
            .map(|t| (t, self.score(t, dependents.get(&t.id).copied().unwrap_or(0), now)))
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| match sb.total_cmp(sa) {
            Ordering::Equal => a.sequence.cmp(&b.sequence),
            other => other,
        });
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskPriority;
    use chrono::Duration;

    fn task_at(created: DateTime<Utc>, sequence: u64) -> Task {
        let mut task = Task::new(Uuid::new_v4(), "score me").with_created_at(created);
        task.sequence = sequence;
        task
    }

    #[test]
    fn test_fresh_medium_task_scores_priority_term_only() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let task = task_at(now, 1);
        let score = scorer.score(&task, 0, now);
        assert!((score - 0.45 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_older_task_ranks_higher() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let young = task_at(now - Duration::minutes(1), 2);
        let old = task_at(now - Duration::minutes(30), 1);
        assert!(scorer.score(&old, 0, now) > scorer.score(&young, 0, now));
    }

    #[test]
    fn test_age_term_clamps_at_ceiling() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let a = scorer.breakdown(&task_at(now - Duration::hours(1), 1), 0, now);
        let b = scorer.breakdown(&task_at(now - Duration::minutes(119), 1), 0, now);
        assert!((a.age - 0.20).abs() < 1e-9);
        assert!((b.age - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_dependents_increase_score() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let task = task_at(now, 1);
        let none = scorer.score(&task, 0, now);
        let five = scorer.score(&task, 5, now);
        let many = scorer.score(&task, 50, now);
        assert!(five > none);
        assert!((many - none - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_retry_penalty_reduces_score() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let clean = task_at(now, 1);
        let mut flaky = task_at(now, 2);
        flaky.retry_count = 2;
        let diff = scorer.score(&clean, 0, now) - scorer.score(&flaky, 0, now);
        assert!((diff - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_deadline_inside_window_is_boosted() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let far = task_at(now, 1).with_deadline(now + Duration::days(2));
        let near = task_at(now, 2).with_deadline(now + Duration::minutes(5));
        let overdue = task_at(now, 3).with_deadline(now - Duration::minutes(5));

        let far_b = scorer.breakdown(&far, 0, now);
        let near_b = scorer.breakdown(&near, 0, now);
        let overdue_b = scorer.breakdown(&overdue, 0, now);

        assert!(!far_b.sla_boosted);
        assert!(near_b.sla_boosted);
        assert!((overdue_b.deadline - 0.15).abs() < 1e-9);
        assert!(overdue_b.total > near_b.total && near_b.total > far_b.total);
    }

    #[test]
    fn test_starvation_floor_lifts_penalised_task() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let mut starving = task_at(now - Duration::hours(3), 1).with_priority(TaskPriority::Low);
        starving.retry_count = 10;
        let b = scorer.breakdown(&starving, 0, now);
        assert!(b.starvation_floored);
        assert!((b.total - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_rank_breaks_ties_by_creation_order() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let tasks = vec![task_at(now, 3), task_at(now, 1), task_at(now, 2)];
        let ranked = scorer.rank(&tasks, &HashMap::new(), now);
        let order: Vec<u64> = ranked.iter().map(|(t, _)| t.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_score_is_deterministic() {
        let scorer = PriorityScorer::default();
        let now = Utc::now();
        let task = task_at(now - Duration::minutes(17), 1).with_deadline(now + Duration::hours(1));
        assert_eq!(scorer.score(&task, 3, now).to_bits(), scorer.score(&task, 3, now).to_bits());
    }
}
