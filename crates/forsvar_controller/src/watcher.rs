// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::hooks::{LifecycleHooks, TaskHandle};
use chrono::{DateTime, Utc};
use forsvar_common::models::{ChallengeId, CompetitionStatus};
use forsvar_common::store::{Store, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Moves competitions through their time window and fires the lifecycle hooks for every status
/// and challenge visibility change it observes.
pub struct CompetitionWatcher {
    store: Arc<dyn Store>,
    hooks: LifecycleHooks,
    /// The last observed visibility of every challenge in a running competition
    public_challenges: HashMap<ChallengeId, bool>,
}

impl CompetitionWatcher {
    pub fn new(store: Arc<dyn Store>, hooks: LifecycleHooks) -> Self {
        Self {
            store,
            hooks,
            public_challenges: HashMap::new(),
        }
    }

    /// Fires the start hook for competitions that are already running, e.g. after a restart. The
    /// hook is idempotent so instances and schedulers that survived are left alone. Competitions
    /// whose end passed in the meantime are left for [Self::check] to end.
    pub async fn resume(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskHandle>, StoreError> {
        let mut handles = Vec::new();
        for competition in self.store.competitions().await? {
            if competition.is_running() && now < competition.end_time {
                info!(competition_id = competition.id, "resuming running competition");
                handles.push(self.hooks.on_competition_start(competition.id));
            }
        }
        self.observe_challenges().await?;
        Ok(handles)
    }

    /// Applies the status transitions that are due at `now`
    pub async fn check(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskHandle>, StoreError> {
        let mut handles = Vec::new();
        for competition in self.store.competitions().await? {
            let ended = now >= competition.end_time;
            let next = match competition.status {
                CompetitionStatus::Pending if ended => Some(CompetitionStatus::Ended),
                CompetitionStatus::Pending if now >= competition.start_time => {
                    Some(CompetitionStatus::Running)
                }
                CompetitionStatus::Running | CompetitionStatus::Paused if ended => {
                    Some(CompetitionStatus::Ended)
                }
                _ => None,
            };
            let Some(next) = next else {
                continue;
            };

            self.store
                .set_competition_status(competition.id, next)
                .await?;
            info!(
                competition_id = competition.id,
                from = ?competition.status,
                to = ?next,
                "competition status changed"
            );
            handles.push(match next {
                CompetitionStatus::Running => self.hooks.on_competition_start(competition.id),
                _ => self.hooks.on_competition_end(competition.id),
            });
        }

        handles.extend(self.observe_challenges().await?);
        Ok(handles)
    }

    /// Fires the challenge hooks for visibility changes within running competitions. The first
    /// observation of a challenge only records its visibility.
    async fn observe_challenges(&mut self) -> Result<Vec<TaskHandle>, StoreError> {
        let mut handles = Vec::new();
        for competition in self.store.competitions().await? {
            if !competition.is_running() {
                continue;
            }
            for challenge in self.store.challenges(competition.id).await? {
                let public = challenge.is_public();
                let previous = self.public_challenges.insert(challenge.id, public);
                match previous {
                    Some(false) if public => {
                        info!(challenge_id = challenge.id, "challenge activated");
                        handles.push(
                            self.hooks
                                .on_challenge_activated(competition.id, challenge.id),
                        );
                    }
                    Some(true) if !public => {
                        info!(challenge_id = challenge.id, "challenge deactivated");
                        handles.push(
                            self.hooks
                                .on_challenge_deactivated(competition.id, challenge.id),
                        );
                    }
                    _ => {}
                }
            }
        }
        Ok(handles)
    }

    pub async fn run(mut self, interval: Duration, cancellation_token: CancellationToken) {
        if let Err(error) = self.resume(Utc::now()).await {
            warn! {
                ?error,
                "unable to resume running competitions"
            }
        }

        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = cancellation_token.cancelled() => break,
            }
            if let Err(error) = self.check(Utc::now()).await {
                warn! {
                    ?error,
                    "unable to check competition time windows"
                }
            }
        }
        info!("competition watcher stopped");
    }
}
