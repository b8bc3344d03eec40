// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::judge::{Judge, JudgeTask};
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{run_loop, JudgingGuard, Scheduler, SchedulerState, SchedulerStatus};
use chrono::Utc;
use forsvar_common::config::SchedulerConfig;
use forsvar_common::models::{
    defense_success, AttackResult, CompetitionId, CompetitionMode, CompetitionStatus, RoundStatus,
    ScoreChanged,
};
use forsvar_common::store::{InstanceFilter, Store, StoreError};
use forsvar_common::utils::time::resume_next_attack;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("competition {0} not found")]
    NotFound(CompetitionId),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

enum TaskOutcome {
    Judged,
    AlreadyJudged,
    Failed,
}

/// Owns the round schedulers of every competition. Cloning the registry is cheap and every clone
/// refers to the same schedulers.
#[derive(Clone)]
pub struct SchedulerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn Store>,
    judge: Arc<dyn Judge>,
    config: SchedulerConfig,
    metrics: SchedulerMetrics,
    score_tx: flume::Sender<ScoreChanged>,
    schedulers: Mutex<HashMap<CompetitionId, Arc<Scheduler>>>,
    /// Outlives the schedulers so that at most one round per competition is judged at a time
    judging: Mutex<HashMap<CompetitionId, Arc<AtomicBool>>>,
    cancellation_token: CancellationToken,
}

impl SchedulerRegistry {
    /// `score_tx` receives an event after every completed round. Cancelling the token stops every
    /// scheduler of the registry.
    pub fn new(
        store: Arc<dyn Store>,
        judge: Arc<dyn Judge>,
        config: SchedulerConfig,
        score_tx: flume::Sender<ScoreChanged>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                judge,
                config,
                metrics: SchedulerMetrics::default(),
                score_tx,
                schedulers: Mutex::new(HashMap::new()),
                judging: Mutex::new(HashMap::new()),
                cancellation_token,
            }),
        }
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.inner.metrics
    }

    fn schedulers(&self) -> MutexGuard<'_, HashMap<CompetitionId, Arc<Scheduler>>> {
        self.inner
            .schedulers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn judging_flag(&self, competition_id: CompetitionId) -> Arc<AtomicBool> {
        self.inner
            .judging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(competition_id)
            .or_default()
            .clone()
    }

    fn lookup(&self, competition_id: CompetitionId) -> Option<Arc<Scheduler>> {
        self.schedulers().get(&competition_id).cloned()
    }

    /// Starts the competition's scheduler unless it's already running. Round numbering continues
    /// from the persisted rounds.
    pub async fn start(&self, competition_id: CompetitionId) -> Result<(), SchedulerError> {
        if self.lookup(competition_id).is_some() {
            debug!(competition_id, "scheduler is already running");
            return Ok(());
        }

        let competition = self
            .inner
            .store
            .competition(competition_id)
            .await?
            .ok_or(SchedulerError::NotFound(competition_id))?;
        let interval = competition
            .defense_interval
            .unwrap_or(self.inner.config.default_interval)
            .max(1);
        let concurrency = competition
            .judge_concurrency
            .unwrap_or(self.inner.config.default_concurrency)
            .max(1);

        let now = Utc::now();
        let (current_round, resume_round, next_attack) =
            match self.inner.store.latest_round(competition_id).await? {
                Some(round) if round.status == RoundStatus::Running => {
                    info!(
                        competition_id,
                        round = round.number,
                        "resuming an unfinished round"
                    );
                    (
                        round.number,
                        Some(round.number),
                        resume_next_attack(None, interval, now),
                    )
                }
                Some(round) => (
                    round.number,
                    None,
                    resume_next_attack(round.completed_at, interval, now),
                ),
                None => (0, None, resume_next_attack(None, interval, now)),
            };

        let state = SchedulerState {
            running: true,
            current_round,
            resume_round,
            interval,
            concurrency,
            next_attack,
        };
        let (scheduler, trigger_rx) = Scheduler::new(
            competition_id,
            state,
            self.judging_flag(competition_id),
            self.inner.cancellation_token.child_token(),
        );

        {
            let mut schedulers = self.schedulers();
            if schedulers.contains_key(&competition_id) {
                // Another caller won the race
                return Ok(());
            }
            schedulers.insert(competition_id, scheduler.clone());
        }

        info!(
            competition_id,
            current_round, interval, concurrency, "starting scheduler"
        );
        tokio::spawn(run_loop(scheduler, self.clone(), trigger_rx));
        Ok(())
    }

    /// Stops the competition's scheduler. A round in progress is allowed to finish.
    pub fn stop(&self, competition_id: CompetitionId) {
        let removed = self.schedulers().remove(&competition_id);
        match removed {
            Some(scheduler) => {
                scheduler.shutdown();
                info!(competition_id, "scheduler stop requested");
            }
            None => debug!(competition_id, "no scheduler to stop"),
        }
    }

    pub fn status(&self, competition_id: CompetitionId) -> SchedulerStatus {
        match self.lookup(competition_id) {
            Some(scheduler) => scheduler.status(Utc::now()),
            None => SchedulerStatus::default(),
        }
    }

    /// Queues a round to be fired on the next tick. Returns `false` if the scheduler isn't
    /// running or a triggered round is already pending.
    pub fn trigger_next_round(&self, competition_id: CompetitionId) -> bool {
        self.lookup(competition_id)
            .is_some_and(|scheduler| scheduler.trigger())
    }

    /// Changes the round length. The new interval applies from the next completed round on.
    pub fn update_interval(&self, competition_id: CompetitionId, seconds: u64) -> bool {
        if seconds == 0 {
            return false;
        }
        let Some(scheduler) = self.lookup(competition_id) else {
            return false;
        };
        scheduler.state().interval = seconds;
        info!(competition_id, seconds, "defense interval updated");
        true
    }

    fn remove(&self, scheduler: &Arc<Scheduler>) {
        let mut schedulers = self.schedulers();
        if schedulers
            .get(&scheduler.competition_id)
            .is_some_and(|current| Arc::ptr_eq(current, scheduler))
        {
            schedulers.remove(&scheduler.competition_id);
        }
        drop(schedulers);
        scheduler.shutdown();
    }

    #[cfg(test)]
    pub(crate) async fn run_round_now(&self, competition_id: CompetitionId) -> Option<u32> {
        let scheduler = self.lookup(competition_id)?;
        self.run_round(&scheduler).await
    }

    /// Judges one round. Returns the round number if the round was completed.
    pub(crate) async fn run_round(&self, scheduler: &Arc<Scheduler>) -> Option<u32> {
        let Some(_guard) = JudgingGuard::acquire(scheduler) else {
            debug!(
                competition_id = scheduler.competition_id,
                "a round is already in progress"
            );
            return None;
        };
        let competition_id = scheduler.competition_id;
        let store = &self.inner.store;

        let competition = match store.competition(competition_id).await {
            Ok(Some(competition)) => competition,
            Ok(None) => {
                warn!(competition_id, "competition is gone, stopping the scheduler");
                self.remove(scheduler);
                return None;
            }
            Err(error) => {
                warn! {
                    ?error,
                    competition_id,
                    "unable to read the competition, skipping round"
                }
                return None;
            }
        };
        if competition.status == CompetitionStatus::Ended {
            info!(competition_id, "competition has ended, stopping the scheduler");
            self.remove(scheduler);
            return None;
        }
        if !competition.is_running() || competition.mode != CompetitionMode::AttackDefense {
            debug!(competition_id, "competition isn't judged right now");
            return None;
        }

        let resume_round = scheduler.state().resume_round;
        if let Some(round) = resume_round {
            // The previous scheduler may have finished the round after this one was started
            if let Ok(Some(persisted)) = store.round(competition_id, round).await {
                if persisted.status == RoundStatus::Completed {
                    debug!(competition_id, round, "unfinished round was completed meanwhile");
                    scheduler.state().resume_round = None;
                }
            }
        }

        let start = tokio::time::Instant::now();
        let round = scheduler.next_round();
        if let Err(error) = store.upsert_round(competition_id, round, Utc::now()).await {
            warn! {
                ?error,
                competition_id,
                round,
                "unable to record round start"
            }
        }
        self.inner.metrics.rounds_started.inc();

        let tasks = match self.collect_tasks(competition_id, round).await {
            Ok(tasks) => tasks,
            Err(error) => {
                warn! {
                    ?error,
                    competition_id,
                    round,
                    "unable to collect judging tasks, the round will be retried"
                }
                scheduler.state().resume_round = Some(round);
                scheduler.reschedule(Utc::now());
                return None;
            }
        };
        let total = tasks.len();
        info!(competition_id, round, tasks = total, "round started");

        if let Err(error) = store
            .set_round_total(competition_id, round, total as u32)
            .await
        {
            warn! {
                ?error,
                competition_id,
                round,
                "unable to record round size"
            }
        }

        let judged = if tasks.is_empty() {
            0
        } else {
            let concurrency = scheduler.state().concurrency;
            self.judge_tasks(competition_id, round, tasks, concurrency)
                .await
        };

        let completed_at = Utc::now();
        if let Err(error) = store
            .complete_round(competition_id, round, completed_at)
            .await
        {
            warn! {
                ?error,
                competition_id,
                round,
                "unable to record round completion"
            }
        }
        self.inner.metrics.rounds_completed.inc();
        self.inner
            .metrics
            .round_duration
            .observe(start.elapsed().as_secs_f64());

        scheduler.reschedule(completed_at);
        if total > 0 {
            let event = ScoreChanged {
                competition_id,
                round,
            };
            if let Err(error) = self.inner.score_tx.try_send(event) {
                debug!(?error, "score change was not delivered");
            }
        }

        info!(competition_id, round, judged, total, "round completed");
        Some(round)
    }

    /// Every (public challenge with an attack script, approved team with a running instance) pair
    async fn collect_tasks(
        &self,
        competition_id: CompetitionId,
        round: u32,
    ) -> Result<Vec<JudgeTask>, StoreError> {
        let store = &self.inner.store;
        let approved: HashSet<_> = store
            .approved_teams(competition_id)
            .await?
            .into_iter()
            .collect();

        let mut tasks = Vec::new();
        for challenge in store.challenges(competition_id).await? {
            if !challenge.is_public() || challenge.attack_script.is_none() {
                continue;
            }
            let challenge = Arc::new(challenge);
            let filter = InstanceFilter::running()
                .competition(competition_id)
                .challenge(challenge.id);
            let mut instances = store.instances(&filter).await?;
            instances.retain(|instance| approved.contains(&instance.team_id));
            instances.sort_by_key(|instance| instance.team_id);

            tasks.extend(instances.into_iter().map(|instance| JudgeTask {
                competition_id,
                round,
                challenge: challenge.clone(),
                instance,
            }));
        }
        Ok(tasks)
    }

    /// Runs the tasks with at most `concurrency` of them at the same time. Returns the amount of
    /// tasks with a recorded result.
    async fn judge_tasks(
        &self,
        competition_id: CompetitionId,
        round: u32,
        tasks: Vec<JudgeTask>,
        concurrency: usize,
    ) -> u32 {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let judged = Arc::new(tokio::sync::Mutex::new(0u32));
        let mut join_set = JoinSet::new();

        for task in tasks {
            let registry = self.clone();
            let semaphore = semaphore.clone();
            let judged = judged.clone();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                match registry.judge_task(&task).await {
                    TaskOutcome::Judged | TaskOutcome::AlreadyJudged => {}
                    TaskOutcome::Failed => return,
                }

                let mut judged = judged.lock().await;
                *judged += 1;
                if let Err(error) = registry
                    .inner
                    .store
                    .set_round_judged(competition_id, round, *judged)
                    .await
                {
                    warn! {
                        ?error,
                        competition_id,
                        round,
                        "unable to record round progress"
                    }
                }
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(error) = result {
                warn! {
                    ?error,
                    competition_id,
                    round,
                    "judging task panicked"
                }
            }
        }
        let judged = *judged.lock().await;
        judged
    }

    async fn judge_task(&self, task: &JudgeTask) -> TaskOutcome {
        let store = &self.inner.store;
        let team_id = task.instance.team_id;
        let challenge = &task.challenge;

        match store
            .has_attack_result(task.competition_id, task.round, team_id, challenge.id)
            .await
        {
            Ok(true) => {
                debug!(team_id, challenge_id = challenge.id, "already judged");
                return TaskOutcome::AlreadyJudged;
            }
            Ok(false) => {}
            Err(error) => {
                warn! {
                    ?error,
                    team_id,
                    challenge_id = challenge.id,
                    "unable to look up an existing result"
                }
                return TaskOutcome::Failed;
            }
        }

        let verdict = match self.inner.judge.judge(task).await {
            Ok(verdict) => verdict,
            Err(error) => {
                self.inner.metrics.infrastructure_failures.inc();
                warn! {
                    ?error,
                    team_id,
                    challenge_id = challenge.id,
                    "unable to judge, no result is recorded"
                }
                return TaskOutcome::Failed;
            }
        };

        let check_success = verdict.check.as_ref().map(|check| check.success);
        let defended = defense_success(verdict.attack.success, check_success);
        let result = AttackResult {
            competition_id: task.competition_id,
            round: task.round,
            team_id,
            challenge_id: challenge.id,
            attack_success: verdict.attack.success,
            check_success: check_success.unwrap_or(true),
            defense_success: defended,
            score: if defended { challenge.defense_award } else { 0 },
            attack_output: verdict.attack.output,
            check_output: verdict.check.map(|check| check.output).unwrap_or_default(),
            created_at: Utc::now(),
        };
        debug!(
            team_id,
            challenge_id = challenge.id,
            attack_success = result.attack_success,
            check_success = result.check_success,
            defended,
            "task judged"
        );

        match store.insert_attack_result(result).await {
            Ok(true) => {
                self.inner.metrics.tasks_judged.inc();
                if defended {
                    self.inner.metrics.defense_successes.inc();
                }
                TaskOutcome::Judged
            }
            Ok(false) => TaskOutcome::AlreadyJudged,
            Err(error) => {
                warn! {
                    ?error,
                    team_id,
                    challenge_id = challenge.id,
                    "unable to record the result"
                }
                TaskOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{JudgeError, ScriptOutcome, Verdict};
    use async_trait::async_trait;
    use chrono::Duration;
    use forsvar_common::models::{
        Challenge, ChallengeVisibility, Competition, NewInstance, PortMap, TeamId,
        TeamMembership,
    };
    use forsvar_common::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeJudge {
        successful_attacks: HashSet<TeamId>,
        broken: HashSet<TeamId>,
        delay_ms: Option<u64>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl Judge for FakeJudge {
        async fn judge(&self, task: &JudgeTask) -> Result<Verdict, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let delay = self.delay_ms.unwrap_or(20);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let team_id = task.instance.team_id;
            if self.broken.contains(&team_id) {
                return Err(JudgeError::NoServicePort(task.challenge.id));
            }
            Ok(Verdict {
                attack: ScriptOutcome {
                    success: self.successful_attacks.contains(&team_id),
                    output: "attack".to_string(),
                },
                check: Some(ScriptOutcome {
                    success: true,
                    output: "ok".to_string(),
                }),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        judge: Arc<FakeJudge>,
        registry: SchedulerRegistry,
        score_rx: flume::Receiver<ScoreChanged>,
    }

    fn challenge(id: i64, visibility: ChallengeVisibility) -> Challenge {
        Challenge {
            id,
            competition_id: 1,
            name: format!("challenge-{id}"),
            visibility,
            image: Some("notes:latest".to_string()),
            ports: vec![80],
            resources: Default::default(),
            attack_script: Some("exploit".to_string()),
            check_script: Some("check".to_string()),
            flag: None,
            flag_env: Vec::new(),
            flag_script: None,
            defense_award: 10,
        }
    }

    async fn add_instance(store: &MemoryStore, team_id: TeamId, challenge_id: i64) {
        store
            .upsert_instance(NewInstance {
                team_id,
                challenge_id,
                competition_id: 1,
                mode: CompetitionMode::AttackDefense,
                container_id: format!("container-{team_id}-{challenge_id}"),
                ports: PortMap::from([(80, 30000 + team_id as u16)]),
                credential: String::new(),
                flag: format!("flag{{{team_id}}}"),
                expires_at: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap();
    }

    async fn fixture_with(judge: FakeJudge, with_instances: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_competition(Competition {
                id: 1,
                name: "finals".to_string(),
                status: CompetitionStatus::Running,
                mode: CompetitionMode::AttackDefense,
                start_time: Utc::now() - Duration::hours(1),
                end_time: Utc::now() + Duration::hours(1),
                defense_interval: Some(60),
                judge_concurrency: Some(2),
            })
            .await;
        store
            .insert_challenge(challenge(1, ChallengeVisibility::Public))
            .await;
        store
            .insert_challenge(challenge(2, ChallengeVisibility::Hidden))
            .await;
        for team_id in 1..=4 {
            store
                .insert_membership(TeamMembership {
                    team_id,
                    competition_id: 1,
                    name: None,
                    approved: team_id != 4,
                })
                .await;
            if with_instances {
                add_instance(&store, team_id, 1).await;
            }
        }
        if with_instances {
            add_instance(&store, 1, 2).await;
        }

        let judge = Arc::new(judge);
        let (score_tx, score_rx) = flume::unbounded();
        let registry = SchedulerRegistry::new(
            store.clone(),
            judge.clone(),
            SchedulerConfig::default(),
            score_tx,
            CancellationToken::new(),
        );
        Fixture {
            store,
            judge,
            registry,
            score_rx,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(FakeJudge::default(), true).await
    }

    #[tokio::test]
    async fn should_judge_every_team_with_bounded_concurrency() {
        let f = fixture_with(
            FakeJudge {
                successful_attacks: HashSet::from([2]),
                ..Default::default()
            },
            true,
        )
        .await;
        f.registry.start(1).await.unwrap();

        let status = f.registry.status(1);
        assert!(status.running);
        assert_eq!(status.current_round, 0);
        assert_eq!(status.defense_interval, 60);
        assert_eq!(status.judge_concurrency, 2);
        assert!((59..=60).contains(&status.next_attack_seconds_remaining));

        assert_eq!(f.registry.run_round_now(1).await, Some(1));

        let mut results = f.store.attack_results(1, 1).await.unwrap();
        results.sort_by_key(|result| result.team_id);
        assert_eq!(results.len(), 3);
        let scores: Vec<_> = results
            .iter()
            .map(|result| (result.team_id, result.defense_success, result.score))
            .collect();
        assert_eq!(scores, vec![(1, true, 10), (2, false, 0), (3, true, 10)]);
        assert_eq!(f.judge.max_active.load(Ordering::SeqCst), 2);

        let round = f.store.round(1, 1).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.total_tasks, 3);
        assert_eq!(round.judged_tasks, 3);
        assert_eq!(
            f.score_rx.try_recv().unwrap(),
            ScoreChanged {
                competition_id: 1,
                round: 1
            }
        );

        let status = f.registry.status(1);
        assert_eq!(status.current_round, 1);
        assert!(!status.judging);
        assert!((59..=60).contains(&status.next_attack_seconds_remaining));
        assert_eq!(f.registry.metrics().defense_successes.get(), 2);
    }

    #[tokio::test]
    async fn should_continue_round_numbers_across_restarts() {
        let f = fixture().await;
        f.registry.start(1).await.unwrap();
        assert_eq!(f.registry.run_round_now(1).await, Some(1));
        assert_eq!(f.registry.run_round_now(1).await, Some(2));

        f.registry.stop(1);
        assert!(!f.registry.status(1).running);
        assert_eq!(f.registry.run_round_now(1).await, None);

        f.registry.start(1).await.unwrap();
        assert_eq!(f.registry.status(1).current_round, 2);
        assert_eq!(f.registry.run_round_now(1).await, Some(3));
        assert_eq!(f.store.attack_results(1, 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn should_fire_round_when_due() {
        let f = fixture().await;
        let mut competition = f.store.competition(1).await.unwrap().unwrap();
        competition.defense_interval = Some(1);
        f.store.insert_competition(competition).await;

        f.registry.start(1).await.unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), f.score_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.round, 1);

        let round = f.store.round(1, 1).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.judged_tasks, 3);
        let completed_at = round.completed_at.unwrap();
        let scheduler = f.registry.lookup(1).unwrap();
        assert_eq!(
            scheduler.state().next_attack,
            completed_at + Duration::seconds(1)
        );
    }

    #[tokio::test]
    async fn should_not_judge_twice_when_restarted_during_round() {
        let f = fixture_with(
            FakeJudge {
                delay_ms: Some(300),
                ..Default::default()
            },
            true,
        )
        .await;
        f.registry.start(1).await.unwrap();

        let registry = f.registry.clone();
        let first = tokio::spawn(async move { registry.run_round_now(1).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        f.registry.stop(1);
        f.registry.start(1).await.unwrap();
        assert!(f.registry.status(1).judging);
        assert_eq!(f.registry.run_round_now(1).await, None);

        assert_eq!(first.await.unwrap(), Some(1));
        assert_eq!(f.judge.calls.load(Ordering::SeqCst), 3);
        assert!(f.judge.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(f.store.attack_results(1, 1).await.unwrap().len(), 3);

        // Round 1 was completed by the stopped scheduler
        assert_eq!(f.registry.run_round_now(1).await, Some(2));
        assert_eq!(f.judge.calls.load(Ordering::SeqCst), 6);
        assert!(f.judge.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn should_not_catch_up_on_missed_rounds() {
        let f = fixture().await;
        let long_ago = Utc::now() - Duration::days(2);
        f.store.upsert_round(1, 1, long_ago).await.unwrap();
        f.store
            .complete_round(1, 1, long_ago + Duration::minutes(1))
            .await
            .unwrap();

        f.registry.start(1).await.unwrap();
        let status = f.registry.status(1);
        assert_eq!(status.current_round, 1);
        assert!((59..=60).contains(&status.next_attack_seconds_remaining));
    }

    #[tokio::test]
    async fn should_resume_partially_judged_round() {
        let f = fixture().await;
        f.store.upsert_round(1, 1, Utc::now()).await.unwrap();
        f.store
            .insert_attack_result(AttackResult {
                competition_id: 1,
                round: 1,
                team_id: 1,
                challenge_id: 1,
                attack_success: false,
                check_success: true,
                defense_success: true,
                score: 10,
                attack_output: String::new(),
                check_output: String::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        f.registry.start(1).await.unwrap();
        assert_eq!(f.registry.run_round_now(1).await, Some(1));
        assert_eq!(f.judge.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.store.attack_results(1, 1).await.unwrap().len(), 3);
        let round = f.store.round(1, 1).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.judged_tasks, 3);

        assert_eq!(f.registry.run_round_now(1).await, Some(2));
    }

    #[tokio::test]
    async fn should_complete_empty_round() {
        let f = fixture_with(FakeJudge::default(), false).await;
        f.registry.start(1).await.unwrap();
        assert_eq!(f.registry.run_round_now(1).await, Some(1));

        let round = f.store.round(1, 1).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.total_tasks, 0);
        assert!(f.score_rx.try_recv().is_err());
        assert!(!f.registry.status(1).judging);
    }

    #[tokio::test]
    async fn should_record_nothing_for_infrastructure_failures() {
        let f = fixture_with(
            FakeJudge {
                broken: HashSet::from([3]),
                ..Default::default()
            },
            true,
        )
        .await;
        f.registry.start(1).await.unwrap();
        assert_eq!(f.registry.run_round_now(1).await, Some(1));

        let results = f.store.attack_results(1, 1).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| result.team_id != 3));
        assert_eq!(f.registry.metrics().infrastructure_failures.get(), 1);
        let round = f.store.round(1, 1).await.unwrap().unwrap();
        assert_eq!(round.judged_tasks, 2);
    }

    #[tokio::test]
    async fn should_accept_one_pending_trigger() {
        let f = fixture().await;
        assert!(!f.registry.trigger_next_round(1));

        f.registry.start(1).await.unwrap();
        assert!(f.registry.trigger_next_round(1));
        assert!(!f.registry.trigger_next_round(1));

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), f.score_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.round, 1);
    }

    #[tokio::test]
    async fn should_stop_when_competition_ended() {
        let f = fixture().await;
        f.registry.start(1).await.unwrap();
        f.store
            .set_competition_status(1, CompetitionStatus::Ended)
            .await
            .unwrap();

        assert_eq!(f.registry.run_round_now(1).await, None);
        assert!(!f.registry.status(1).running);
        assert!(!f.registry.trigger_next_round(1));
    }

    #[tokio::test]
    async fn should_skip_rounds_while_paused() {
        let f = fixture().await;
        f.registry.start(1).await.unwrap();
        f.store
            .set_competition_status(1, CompetitionStatus::Paused)
            .await
            .unwrap();

        assert_eq!(f.registry.run_round_now(1).await, None);
        let status = f.registry.status(1);
        assert!(status.running);
        assert_eq!(status.current_round, 0);
    }

    #[tokio::test]
    async fn should_apply_interval_from_next_round() {
        let f = fixture().await;
        assert!(!f.registry.update_interval(1, 120));

        f.registry.start(1).await.unwrap();
        assert!(!f.registry.update_interval(1, 0));
        assert!(f.registry.update_interval(1, 120));

        let status = f.registry.status(1);
        assert_eq!(status.defense_interval, 120);
        assert!(status.next_attack_seconds_remaining <= 60);

        f.registry.run_round_now(1).await.unwrap();
        let remaining = f.registry.status(1).next_attack_seconds_remaining;
        assert!((119..=120).contains(&remaining));
    }
}
