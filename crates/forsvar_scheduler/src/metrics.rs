// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct SchedulerMetrics {
    pub rounds_started: Counter,
    pub rounds_completed: Counter,
    pub round_duration: Histogram,
    pub tasks_judged: Counter,
    pub defense_successes: Counter,
    pub infrastructure_failures: Counter,
}

impl SchedulerMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "forsvar_scheduler_rounds_started",
            "The number of rounds started",
            self.rounds_started.clone(),
        );
        registry.register(
            "forsvar_scheduler_rounds_completed",
            "The number of rounds completed",
            self.rounds_completed.clone(),
        );
        registry.register(
            "forsvar_scheduler_round_duration_seconds",
            "A histogram for the amount of time taken to judge a round",
            self.round_duration.clone(),
        );
        registry.register(
            "forsvar_scheduler_tasks_judged",
            "The number of recorded attack results",
            self.tasks_judged.clone(),
        );
        registry.register(
            "forsvar_scheduler_defense_successes",
            "The number of recorded successful defenses",
            self.defense_successes.clone(),
        );
        registry.register(
            "forsvar_scheduler_infrastructure_failures",
            "The number of judging tasks aborted without an outcome",
            self.infrastructure_failures.clone(),
        );
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            rounds_started: Default::default(),
            rounds_completed: Default::default(),
            round_duration: Histogram::new(exponential_buckets(0.5, 2.0, 12)),
            tasks_judged: Default::default(),
            defense_successes: Default::default(),
            infrastructure_failures: Default::default(),
        }
    }
}
