// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::models::{
    ports, AttackResult, Challenge, ChallengeId, Competition, CompetitionId, CompetitionStatus,
    Instance, InstanceId, InstanceStatus, NewInstance, Patch, Round, RoundStatus, TeamId,
    TeamMembership,
};
use crate::store::{InstanceFilter, Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    competitions: BTreeMap<CompetitionId, Competition>,
    challenges: BTreeMap<ChallengeId, Challenge>,
    memberships: Vec<TeamMembership>,
    port_blocks: HashMap<(CompetitionId, TeamId), String>,
    /// Keyed by (team, challenge), at most one record per pair
    instances: BTreeMap<(TeamId, ChallengeId), Instance>,
    next_instance_id: InstanceId,
    patches: Vec<Patch>,
    rounds: BTreeMap<(CompetitionId, u32), Round>,
    results: BTreeMap<(CompetitionId, u32, TeamId, ChallengeId), AttackResult>,
}

/// A [Store] that keeps everything in memory. It is used by single-node setups that seed their
/// competition data from the config file, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_competition(&self, competition: Competition) {
        let mut tables = self.tables.write().await;
        tables.competitions.insert(competition.id, competition);
    }

    pub async fn insert_challenge(&self, challenge: Challenge) {
        let mut tables = self.tables.write().await;
        tables.challenges.insert(challenge.id, challenge);
    }

    pub async fn insert_membership(&self, membership: TeamMembership) {
        let mut tables = self.tables.write().await;
        tables.memberships.retain(|existing| {
            existing.team_id != membership.team_id
                || existing.competition_id != membership.competition_id
        });
        tables.memberships.push(membership);
    }

    pub async fn insert_patch(&self, patch: Patch) {
        self.tables.write().await.patches.push(patch);
    }

    pub async fn patches(&self, team_id: TeamId, challenge_id: ChallengeId) -> Vec<Patch> {
        self.tables
            .read()
            .await
            .patches
            .iter()
            .filter(|patch| patch.team_id == team_id && patch.challenge_id == challenge_id)
            .cloned()
            .collect()
    }

    /// Makes every subsequent write fail with [StoreError::Unavailable] until reset. Used to
    /// exercise persistence failure paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes are disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn competitions(&self) -> Result<Vec<Competition>, StoreError> {
        Ok(self.tables.read().await.competitions.values().cloned().collect())
    }

    async fn competition(&self, id: CompetitionId) -> Result<Option<Competition>, StoreError> {
        Ok(self.tables.read().await.competitions.get(&id).cloned())
    }

    async fn set_competition_status(
        &self,
        id: CompetitionId,
        status: CompetitionStatus,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let competition = tables
            .competitions
            .get_mut(&id)
            .ok_or(StoreError::NotFound("competition"))?;
        competition.status = status;
        Ok(())
    }

    async fn challenges(&self, competition_id: CompetitionId) -> Result<Vec<Challenge>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .challenges
            .values()
            .filter(|challenge| challenge.competition_id == competition_id)
            .cloned()
            .collect())
    }

    async fn challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError> {
        Ok(self.tables.read().await.challenges.get(&id).cloned())
    }

    async fn approved_teams(&self, competition_id: CompetitionId) -> Result<Vec<TeamId>, StoreError> {
        let tables = self.tables.read().await;
        let mut teams: Vec<TeamId> = tables
            .memberships
            .iter()
            .filter(|membership| membership.competition_id == competition_id && membership.approved)
            .map(|membership| membership.team_id)
            .collect();
        teams.sort_unstable();
        Ok(teams)
    }

    async fn team_port_block(
        &self,
        competition_id: CompetitionId,
        team_id: TeamId,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .port_blocks
            .get(&(competition_id, team_id))
            .cloned())
    }

    async fn team_port_blocks(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.read().await.port_blocks.values().cloned().collect())
    }

    async fn put_team_port_block(
        &self,
        competition_id: CompetitionId,
        team_id: TeamId,
        block: String,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables
            .write()
            .await
            .port_blocks
            .insert((competition_id, team_id), block);
        Ok(())
    }

    async fn instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .instances
            .values()
            .find(|instance| instance.id == id)
            .cloned())
    }

    async fn instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .instances
            .values()
            .filter(|instance| filter.matches(instance))
            .cloned()
            .collect())
    }

    async fn upsert_instance(&self, new: NewInstance) -> Result<Instance, StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.next_instance_id += 1;
        let instance = Instance {
            id: tables.next_instance_id,
            team_id: new.team_id,
            challenge_id: new.challenge_id,
            competition_id: new.competition_id,
            mode: new.mode,
            container_id: new.container_id,
            ports: ports::encode_port_map(&new.ports),
            credential: new.credential,
            flag: new.flag,
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            expires_at: new.expires_at,
        };
        tables
            .instances
            .insert((new.team_id, new.challenge_id), instance.clone());
        Ok(instance)
    }

    async fn transition_instance(
        &self,
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let instance = tables
            .instances
            .values_mut()
            .find(|instance| instance.id == id && instance.status == from);
        Ok(match instance {
            Some(instance) => {
                instance.status = to;
                true
            }
            None => false,
        })
    }

    async fn delete_patches(
        &self,
        team_id: TeamId,
        challenge_id: ChallengeId,
    ) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let before = tables.patches.len();
        tables
            .patches
            .retain(|patch| patch.team_id != team_id || patch.challenge_id != challenge_id);
        Ok((before - tables.patches.len()) as u64)
    }

    async fn latest_round(&self, competition_id: CompetitionId) -> Result<Option<Round>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .rounds
            .range((competition_id, 0)..=(competition_id, u32::MAX))
            .next_back()
            .map(|(_, round)| round.clone()))
    }

    async fn round(
        &self,
        competition_id: CompetitionId,
        number: u32,
    ) -> Result<Option<Round>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .rounds
            .get(&(competition_id, number))
            .cloned())
    }

    async fn upsert_round(
        &self,
        competition_id: CompetitionId,
        number: u32,
        started_at: DateTime<Utc>,
    ) -> Result<Round, StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let round = tables
            .rounds
            .entry((competition_id, number))
            .and_modify(|round| {
                round.status = RoundStatus::Running;
                round.started_at = started_at;
                round.completed_at = None;
            })
            .or_insert_with(|| Round {
                competition_id,
                number,
                status: RoundStatus::Running,
                started_at,
                completed_at: None,
                total_tasks: 0,
                judged_tasks: 0,
            });
        Ok(round.clone())
    }

    async fn set_round_total(
        &self,
        competition_id: CompetitionId,
        number: u32,
        total_tasks: u32,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let round = tables
            .rounds
            .get_mut(&(competition_id, number))
            .ok_or(StoreError::NotFound("round"))?;
        round.total_tasks = total_tasks;
        Ok(())
    }

    async fn set_round_judged(
        &self,
        competition_id: CompetitionId,
        number: u32,
        judged_tasks: u32,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let round = tables
            .rounds
            .get_mut(&(competition_id, number))
            .ok_or(StoreError::NotFound("round"))?;
        round.judged_tasks = judged_tasks;
        Ok(())
    }

    async fn complete_round(
        &self,
        competition_id: CompetitionId,
        number: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let round = tables
            .rounds
            .get_mut(&(competition_id, number))
            .ok_or(StoreError::NotFound("round"))?;
        round.status = RoundStatus::Completed;
        round.completed_at = Some(completed_at);
        Ok(())
    }

    async fn has_attack_result(
        &self,
        competition_id: CompetitionId,
        round: u32,
        team_id: TeamId,
        challenge_id: ChallengeId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .results
            .contains_key(&(competition_id, round, team_id, challenge_id)))
    }

    async fn insert_attack_result(&self, result: AttackResult) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let key = (
            result.competition_id,
            result.round,
            result.team_id,
            result.challenge_id,
        );
        if tables.results.contains_key(&key) {
            return Ok(false);
        }
        tables.results.insert(key, result);
        Ok(true)
    }

    async fn attack_results(
        &self,
        competition_id: CompetitionId,
        round: u32,
    ) -> Result<Vec<AttackResult>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .results
            .values()
            .filter(|result| result.competition_id == competition_id && result.round == round)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompetitionMode, PortMap};
    use chrono::Duration;

    fn new_instance(team_id: TeamId, challenge_id: ChallengeId, container_id: &str) -> NewInstance {
        let mut ports = PortMap::new();
        ports.insert(80, 30000 + team_id as u16);
        NewInstance {
            team_id,
            challenge_id,
            competition_id: 1,
            mode: CompetitionMode::AttackDefense,
            container_id: container_id.to_string(),
            ports,
            credential: "secret".to_string(),
            flag: "flag{test}".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn should_replace_instance_of_same_pair_with_new_id() {
        let store = MemoryStore::new();
        let first = store.upsert_instance(new_instance(1, 1, "a")).await.unwrap();
        let second = store.upsert_instance(new_instance(1, 1, "b")).await.unwrap();
        assert_ne!(first.id, second.id);

        let instances = store.instances(&InstanceFilter::running()).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].container_id, "b");
        assert_eq!(instances[0].host_port(80), Some(30001));
    }

    #[tokio::test]
    async fn should_not_transition_replaced_instance() {
        let store = MemoryStore::new();
        let first = store.upsert_instance(new_instance(1, 1, "a")).await.unwrap();
        store.upsert_instance(new_instance(1, 1, "b")).await.unwrap();

        let transitioned = store
            .transition_instance(first.id, InstanceStatus::Running, InstanceStatus::Expired)
            .await
            .unwrap();
        assert!(!transitioned);
        assert_eq!(
            store.instances(&InstanceFilter::running()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn should_filter_expired_instances() {
        let store = MemoryStore::new();
        let mut expired = new_instance(1, 1, "a");
        expired.expires_at = Utc::now() - Duration::minutes(1);
        store.upsert_instance(expired).await.unwrap();
        store.upsert_instance(new_instance(2, 1, "b")).await.unwrap();

        let filter = InstanceFilter::running().expires_before(Utc::now());
        let instances = store.instances(&filter).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].container_id, "a");
    }

    #[tokio::test]
    async fn should_keep_round_progress_on_upsert() {
        let store = MemoryStore::new();
        let started = Utc::now();
        store.upsert_round(1, 1, started).await.unwrap();
        store.set_round_total(1, 1, 4).await.unwrap();
        store.set_round_judged(1, 1, 2).await.unwrap();

        let round = store.upsert_round(1, 1, started).await.unwrap();
        assert_eq!(round.total_tasks, 4);
        assert_eq!(round.judged_tasks, 2);
        assert_eq!(round.status, RoundStatus::Running);
    }

    #[tokio::test]
    async fn should_return_latest_round_of_competition_only() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_round(1, 1, now).await.unwrap();
        store.upsert_round(1, 2, now).await.unwrap();
        store.upsert_round(2, 7, now).await.unwrap();

        assert_eq!(store.latest_round(1).await.unwrap().unwrap().number, 2);
        assert_eq!(store.latest_round(2).await.unwrap().unwrap().number, 7);
        assert!(store.latest_round(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_insert_attack_result_once() {
        let store = MemoryStore::new();
        let result = AttackResult {
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
        };
        assert!(store.insert_attack_result(result.clone()).await.unwrap());
        assert!(!store.insert_attack_result(result).await.unwrap());
        assert!(store.has_attack_result(1, 1, 1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn should_reject_writes_when_failing() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        assert!(matches!(
            store.upsert_instance(new_instance(1, 1, "a")).await,
            Err(StoreError::Unavailable(_))
        ));
        store.fail_writes(false);
        assert!(store.upsert_instance(new_instance(1, 1, "a")).await.is_ok());
    }
}
