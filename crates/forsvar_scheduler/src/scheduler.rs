// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::registry::SchedulerRegistry;
use chrono::{DateTime, Utc};
use forsvar_common::models::CompetitionId;
use forsvar_common::utils::time::{interval_duration, seconds_until};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TICK: Duration = Duration::from_secs(1);

/// A point in time view of a competition's scheduler
#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerStatus {
    pub running: bool,
    pub current_round: u32,
    pub defense_interval: u64,
    pub judge_concurrency: usize,
    pub next_attack_seconds_remaining: u64,
    pub judging: bool,
}

pub(crate) struct SchedulerState {
    pub running: bool,
    pub current_round: u32,
    /// A round that was persisted as running but never completed. It is judged again before the
    /// round number advances.
    pub resume_round: Option<u32>,
    pub interval: u64,
    pub concurrency: usize,
    pub next_attack: DateTime<Utc>,
}

pub(crate) struct Scheduler {
    pub competition_id: CompetitionId,
    state: Mutex<SchedulerState>,
    /// Shared by every scheduler the competition ever had, so that a round of a stopped scheduler
    /// keeps blocking new rounds until it finishes
    judging: Arc<AtomicBool>,
    trigger_tx: flume::Sender<()>,
    pub cancellation_token: CancellationToken,
}

impl Scheduler {
    pub fn new(
        competition_id: CompetitionId,
        state: SchedulerState,
        judging: Arc<AtomicBool>,
        cancellation_token: CancellationToken,
    ) -> (Arc<Self>, flume::Receiver<()>) {
        // At most one manual trigger can be pending
        let (trigger_tx, trigger_rx) = flume::bounded(1);
        let scheduler = Arc::new(Self {
            competition_id,
            state: Mutex::new(state),
            judging,
            trigger_tx,
            cancellation_token,
        });
        (scheduler, trigger_rx)
    }

    pub fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn is_judging(&self) -> bool {
        self.judging.load(Ordering::SeqCst)
    }

    pub fn status(&self, now: DateTime<Utc>) -> SchedulerStatus {
        let state = self.state();
        SchedulerStatus {
            running: state.running,
            current_round: state.current_round,
            defense_interval: state.interval,
            judge_concurrency: state.concurrency,
            next_attack_seconds_remaining: seconds_until(state.next_attack, now),
            judging: self.is_judging(),
        }
    }

    pub fn trigger(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.trigger_tx.try_send(()).is_ok()
    }

    /// Stops the loop. The scheduler can't be started again.
    pub fn shutdown(&self) {
        self.state().running = false;
        self.cancellation_token.cancel();
    }

    /// The number of the round to judge next
    pub fn next_round(&self) -> u32 {
        let mut state = self.state();
        match state.resume_round.take() {
            Some(round) => round,
            None => {
                state.current_round += 1;
                state.current_round
            }
        }
    }

    /// Uses the interval that is configured at the time of the call
    pub fn reschedule(&self, now: DateTime<Utc>) {
        let mut state = self.state();
        state.next_attack = now + interval_duration(state.interval);
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state();
        state.running && now >= state.next_attack
    }
}

/// Marks a scheduler as judging for as long as it is held
pub(crate) struct JudgingGuard {
    scheduler: Arc<Scheduler>,
}

impl JudgingGuard {
    pub fn acquire(scheduler: &Arc<Scheduler>) -> Option<Self> {
        scheduler
            .judging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                scheduler: scheduler.clone(),
            })
    }
}

impl Drop for JudgingGuard {
    fn drop(&mut self) {
        self.scheduler.judging.store(false, Ordering::SeqCst);
    }
}

/// Fires a round when one is due or manually triggered. Rounds run on their own tasks so that the
/// loop only ever waits on its timer.
pub(crate) async fn run_loop(
    scheduler: Arc<Scheduler>,
    registry: SchedulerRegistry,
    trigger_rx: flume::Receiver<()>,
) {
    let competition_id = scheduler.competition_id;
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(competition_id, "scheduler started");
    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = scheduler.cancellation_token.cancelled() => break,
        }

        if scheduler.is_judging() {
            continue;
        }
        let triggered = trigger_rx.try_recv().is_ok();
        if triggered || scheduler.is_due(Utc::now()) {
            debug!(competition_id, triggered, "firing round");
            let registry = registry.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                registry.run_round(&scheduler).await;
            });
        }
    }
    info!(competition_id, "scheduler stopped");
}
