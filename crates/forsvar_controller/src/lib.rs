// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

pub mod hooks;
mod metrics;
mod watcher;

pub use hooks::{
    lifecycle_queue, ControllerError, HookOutcome, LifecycleEvent, LifecycleHooks,
    LifecycleWorker, TaskHandle,
};
pub use watcher::CompetitionWatcher;

use color_eyre::eyre::Result;
use forsvar_common::runtime::AppRuntime;
use forsvar_instances::InstanceManager;
use forsvar_scheduler::SchedulerRegistry;
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub async fn main(
    runtime: AppRuntime,
    instances: Arc<InstanceManager>,
    scheduler: SchedulerRegistry,
) -> Result<()> {
    info!("starting controller");

    let (hooks, worker) = lifecycle_queue(runtime.store.clone(), instances, scheduler);
    worker
        .metrics()
        .register(runtime.metrics_registry.write().await.deref_mut());

    let worker_task = tokio::spawn(worker.run(runtime.cancellation_token.clone()));

    let interval = Duration::from_secs(runtime.config.controller.watch_interval.max(1));
    CompetitionWatcher::new(runtime.store.clone(), hooks)
        .run(interval, runtime.cancellation_token.clone())
        .await;

    // Let the hook in progress finish
    _ = worker_task.await;
    Ok(())
}
