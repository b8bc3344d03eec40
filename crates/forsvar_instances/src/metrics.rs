// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct InstanceMetrics {
    pub created: Counter,
    pub create_errors: Counter,
    pub create_duration: Histogram,
    pub destroyed: Counter,
    pub destroy_errors: Counter,
    pub expired: Counter,
}

impl InstanceMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "forsvar_instances_created",
            "The number of instances created",
            self.created.clone(),
        );
        registry.register(
            "forsvar_instances_create_errors",
            "The number of failed instance creations",
            self.create_errors.clone(),
        );
        registry.register(
            "forsvar_instances_create_duration_seconds",
            "A histogram for the amount of time taken to create an instance",
            self.create_duration.clone(),
        );
        registry.register(
            "forsvar_instances_destroyed",
            "The number of instances destroyed by resets and teardowns",
            self.destroyed.clone(),
        );
        registry.register(
            "forsvar_instances_destroy_errors",
            "The number of failed container removals",
            self.destroy_errors.clone(),
        );
        registry.register(
            "forsvar_instances_expired",
            "The number of instances removed by the expiry sweep",
            self.expired.clone(),
        );
    }
}

impl Default for InstanceMetrics {
    fn default() -> Self {
        Self {
            created: Default::default(),
            create_errors: Default::default(),
            create_duration: Histogram::new(exponential_buckets(0.01, 2.0, 14)),
            destroyed: Default::default(),
            destroy_errors: Default::default(),
            expired: Default::default(),
        }
    }
}
