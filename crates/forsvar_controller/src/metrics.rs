// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct HookLabels {
    pub hook: String,
}

#[derive(Default, Clone)]
pub(crate) struct ControllerMetrics {
    pub requests: Family<HookLabels, Counter>,
    pub complete: Family<HookLabels, Counter>,
    pub error: Family<HookLabels, Counter>,
}

impl ControllerMetrics {
    pub(crate) fn register(&self, registry: &mut Registry) {
        registry.register(
            "forsvar_controller_hook_requests",
            "The number of lifecycle hooks submitted",
            self.requests.clone(),
        );
        registry.register(
            "forsvar_controller_hook_complete",
            "The number of completed lifecycle hooks",
            self.complete.clone(),
        );
        registry.register(
            "forsvar_controller_hook_error",
            "The number of failed lifecycle hooks",
            self.error.clone(),
        );
    }
}
