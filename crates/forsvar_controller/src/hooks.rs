// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::metrics::{ControllerMetrics, HookLabels};
use forsvar_common::models::{ChallengeId, CompetitionId, CompetitionMode};
use forsvar_common::store::{Store, StoreError};
use forsvar_instances::{InstanceError, InstanceManager, ProvisionReport, TeardownReport};
use forsvar_scheduler::{SchedulerError, SchedulerRegistry};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("competition {0} not found")]
    CompetitionNotFound(CompetitionId),
    #[error("instance error: {0}")]
    Instances(#[from] InstanceError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("the lifecycle queue has shut down")]
    QueueClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    CompetitionStarted(CompetitionId),
    CompetitionEnded(CompetitionId),
    ChallengeActivated {
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    },
    ChallengeDeactivated {
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    },
}

impl LifecycleEvent {
    fn hook(&self) -> &'static str {
        match self {
            LifecycleEvent::CompetitionStarted(_) => "on_competition_start",
            LifecycleEvent::CompetitionEnded(_) => "on_competition_end",
            LifecycleEvent::ChallengeActivated { .. } => "on_challenge_activated",
            LifecycleEvent::ChallengeDeactivated { .. } => "on_challenge_deactivated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Provisioned(ProvisionReport),
    TornDown(TeardownReport),
    /// The competition's mode has no instances to manage for the event
    Skipped,
}

type HookResult = Result<HookOutcome, ControllerError>;

struct Job {
    event: LifecycleEvent,
    done: oneshot::Sender<HookResult>,
}

/// Completes once the submitted hook has been handled. Dropping the handle doesn't cancel the hook.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<HookResult>,
}

impl TaskHandle {
    pub async fn wait(self) -> HookResult {
        self.rx.await.unwrap_or(Err(ControllerError::QueueClosed))
    }
}

/// Submits lifecycle hooks to the [LifecycleWorker]. Hooks are handled one at a time in submission
/// order.
#[derive(Clone)]
pub struct LifecycleHooks {
    tx: flume::Sender<Job>,
    metrics: ControllerMetrics,
}

impl LifecycleHooks {
    pub fn on_competition_start(&self, competition_id: CompetitionId) -> TaskHandle {
        self.submit(LifecycleEvent::CompetitionStarted(competition_id))
    }

    pub fn on_competition_end(&self, competition_id: CompetitionId) -> TaskHandle {
        self.submit(LifecycleEvent::CompetitionEnded(competition_id))
    }

    pub fn on_challenge_activated(
        &self,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> TaskHandle {
        self.submit(LifecycleEvent::ChallengeActivated {
            competition_id,
            challenge_id,
        })
    }

    pub fn on_challenge_deactivated(
        &self,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> TaskHandle {
        self.submit(LifecycleEvent::ChallengeDeactivated {
            competition_id,
            challenge_id,
        })
    }

    pub fn submit(&self, event: LifecycleEvent) -> TaskHandle {
        let (done, rx) = oneshot::channel();
        let labels = HookLabels {
            hook: event.hook().to_string(),
        };
        self.metrics.requests.get_or_create(&labels).inc();
        if self.tx.send(Job { event, done }).is_err() {
            warn!(?event, "the lifecycle queue has shut down, dropping hook");
        }
        TaskHandle { rx }
    }
}

pub struct LifecycleWorker {
    rx: flume::Receiver<Job>,
    store: Arc<dyn Store>,
    instances: Arc<InstanceManager>,
    scheduler: SchedulerRegistry,
    metrics: ControllerMetrics,
}

/// Creates the hook submitter and the worker that handles the submitted hooks.
pub fn lifecycle_queue(
    store: Arc<dyn Store>,
    instances: Arc<InstanceManager>,
    scheduler: SchedulerRegistry,
) -> (LifecycleHooks, LifecycleWorker) {
    let (tx, rx) = flume::unbounded();
    let metrics = ControllerMetrics::default();
    let hooks = LifecycleHooks {
        tx,
        metrics: metrics.clone(),
    };
    let worker = LifecycleWorker {
        rx,
        store,
        instances,
        scheduler,
        metrics,
    };
    (hooks, worker)
}

impl LifecycleWorker {
    pub(crate) fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    pub async fn run(self, cancellation_token: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = cancellation_token.cancelled() => break,
                job = self.rx.recv_async() => match job {
                    Ok(job) => job,
                    // Every submitter is gone
                    Err(_) => break,
                },
            };

            let labels = HookLabels {
                hook: job.event.hook().to_string(),
            };
            info!(event = ?job.event, "handling lifecycle hook");
            let result = self.handle(job.event).await;
            match &result {
                Ok(outcome) => {
                    debug!(event = ?job.event, ?outcome, "lifecycle hook complete");
                    self.metrics.complete.get_or_create(&labels).inc();
                }
                Err(error) => {
                    warn! {
                        ?error,
                        event = ?job.event,
                        "lifecycle hook failed"
                    }
                    self.metrics.error.get_or_create(&labels).inc();
                }
            }
            // The submitter may not be waiting
            _ = job.done.send(result);
        }
        debug!("lifecycle worker stopped");
    }

    async fn handle(&self, event: LifecycleEvent) -> HookResult {
        match event {
            LifecycleEvent::CompetitionStarted(competition_id) => {
                if self.mode(competition_id).await? != CompetitionMode::AttackDefense {
                    return Ok(HookOutcome::Skipped);
                }
                self.scheduler.start(competition_id).await?;
                let report = self
                    .instances
                    .provision_for_competition_start(competition_id)
                    .await?;
                Ok(HookOutcome::Provisioned(report))
            }
            LifecycleEvent::CompetitionEnded(competition_id) => {
                self.scheduler.stop(competition_id);
                let report = self
                    .instances
                    .teardown_for_competition(competition_id)
                    .await?;
                Ok(HookOutcome::TornDown(report))
            }
            LifecycleEvent::ChallengeActivated {
                competition_id,
                challenge_id,
            } => {
                if self.mode(competition_id).await? != CompetitionMode::AttackDefense {
                    return Ok(HookOutcome::Skipped);
                }
                let report = self
                    .instances
                    .provision_for_challenge_activation(competition_id, challenge_id)
                    .await?;
                Ok(HookOutcome::Provisioned(report))
            }
            LifecycleEvent::ChallengeDeactivated {
                competition_id,
                challenge_id,
            } => {
                let report = self
                    .instances
                    .teardown_for_challenge(competition_id, challenge_id)
                    .await?;
                Ok(HookOutcome::TornDown(report))
            }
        }
    }

    async fn mode(&self, competition_id: CompetitionId) -> Result<CompetitionMode, ControllerError> {
        self.store
            .competition(competition_id)
            .await?
            .map(|competition| competition.mode)
            .ok_or(ControllerError::CompetitionNotFound(competition_id))
    }
}
