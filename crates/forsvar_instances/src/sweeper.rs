// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::manager::{InstanceError, InstanceManager, TeardownReport};
use chrono::Utc;
use forsvar_common::models::InstanceStatus;
use forsvar_common::store::InstanceFilter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl InstanceManager {
    /// Removes the containers of running instances whose expiry has passed and marks them as
    /// expired. Instances whose container could not be removed stay running and are retried on the
    /// next sweep.
    pub async fn sweep_expired(&self) -> Result<TeardownReport, InstanceError> {
        let filter = InstanceFilter::running().expires_before(Utc::now());
        let expired = self.store.instances(&filter).await?;
        let mut report = TeardownReport::default();

        for instance in expired {
            if let Err(error) = self.runtime.remove(&instance.container_id).await {
                report.failed += 1;
                self.metrics.destroy_errors.inc();
                warn! {
                    ?error,
                    instance_id = instance.id,
                    container_id = instance.container_id,
                    "unable to remove expired container"
                }
                continue;
            }

            match self
                .store
                .transition_instance(instance.id, InstanceStatus::Running, InstanceStatus::Expired)
                .await
            {
                Ok(true) => {
                    report.destroyed += 1;
                    self.metrics.expired.inc();
                }
                // Replaced or destroyed while the sweep was running
                Ok(false) => debug!(instance_id = instance.id, "instance already retired"),
                Err(error) => {
                    report.failed += 1;
                    warn! {
                        ?error,
                        instance_id = instance.id,
                        "unable to mark instance as expired"
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Periodically sweeps expired instances until cancelled.
pub async fn run_sweeper(
    manager: Arc<InstanceManager>,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("starting the expiry sweeper");
    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = cancellation_token.cancelled() => break,
        }

        match manager.sweep_expired().await {
            Ok(report) if report.destroyed + report.failed > 0 => {
                info!(
                    expired = report.destroyed,
                    failed = report.failed,
                    "expired instances swept"
                );
            }
            Ok(_) => {}
            Err(error) => {
                warn! {
                    ?error,
                    "unable to sweep expired instances"
                }
            }
        }
    }
    info!("the expiry sweeper has stopped");
}
