// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

//! The storage collaborator. Competition, challenge and team metadata is owned by the surrounding
//! platform; instances, rounds and attack results are written by the components in this workspace.

mod memory;

pub use memory::MemoryStore;

use crate::models::{
    AttackResult, Challenge, ChallengeId, Competition, CompetitionId, CompetitionStatus, Instance,
    InstanceId, InstanceStatus, NewInstance, Round, TeamId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("serde_json serialization error")]
    SerdeJson(#[from] serde_json::Error),
}

/// Selects instances. Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceFilter {
    pub competition_id: Option<CompetitionId>,
    pub challenge_id: Option<ChallengeId>,
    pub team_id: Option<TeamId>,
    pub status: Option<InstanceStatus>,
    /// Only instances that expire strictly before this time
    pub expires_before: Option<DateTime<Utc>>,
}

impl InstanceFilter {
    pub fn running() -> Self {
        Self {
            status: Some(InstanceStatus::Running),
            ..Default::default()
        }
    }

    pub fn competition(mut self, competition_id: CompetitionId) -> Self {
        self.competition_id = Some(competition_id);
        self
    }

    pub fn challenge(mut self, challenge_id: ChallengeId) -> Self {
        self.challenge_id = Some(challenge_id);
        self
    }

    pub fn team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn expires_before(mut self, time: DateTime<Utc>) -> Self {
        self.expires_before = Some(time);
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        self.competition_id
            .map_or(true, |id| instance.competition_id == id)
            && self.challenge_id.map_or(true, |id| instance.challenge_id == id)
            && self.team_id.map_or(true, |id| instance.team_id == id)
            && self.status.map_or(true, |status| instance.status == status)
            && self
                .expires_before
                .map_or(true, |time| instance.expires_at < time)
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn competitions(&self) -> Result<Vec<Competition>, StoreError>;

    async fn competition(&self, id: CompetitionId) -> Result<Option<Competition>, StoreError>;

    async fn set_competition_status(
        &self,
        id: CompetitionId,
        status: CompetitionStatus,
    ) -> Result<(), StoreError>;

    async fn challenges(&self, competition_id: CompetitionId) -> Result<Vec<Challenge>, StoreError>;

    async fn challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError>;

    /// The teams whose membership in the competition has been approved
    async fn approved_teams(&self, competition_id: CompetitionId) -> Result<Vec<TeamId>, StoreError>;

    /// The serialized port block that was reserved for the team ahead of instance creation
    async fn team_port_block(
        &self,
        competition_id: CompetitionId,
        team_id: TeamId,
    ) -> Result<Option<String>, StoreError>;

    /// Every serialized port block across all competitions
    async fn team_port_blocks(&self) -> Result<Vec<String>, StoreError>;

    async fn put_team_port_block(
        &self,
        competition_id: CompetitionId,
        team_id: TeamId,
        block: String,
    ) -> Result<(), StoreError>;

    async fn instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError>;

    async fn instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError>;

    /// Records a running instance. The previous record of the same (team, challenge) pair is
    /// replaced and the new record receives a fresh id.
    async fn upsert_instance(&self, instance: NewInstance) -> Result<Instance, StoreError>;

    /// Moves the instance with the given id from one status to another. Returns `false` if no
    /// instance with that id is in the `from` status anymore.
    async fn transition_instance(
        &self,
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, StoreError>;

    /// Deletes the patch records of a (team, challenge) pair. Returns the amount deleted.
    async fn delete_patches(
        &self,
        team_id: TeamId,
        challenge_id: ChallengeId,
    ) -> Result<u64, StoreError>;

    /// The round with the highest number
    async fn latest_round(&self, competition_id: CompetitionId) -> Result<Option<Round>, StoreError>;

    async fn round(
        &self,
        competition_id: CompetitionId,
        number: u32,
    ) -> Result<Option<Round>, StoreError>;

    /// Creates the round in the `running` status. Upserting an existing round number resets its
    /// status and start time but keeps its progress counters.
    async fn upsert_round(
        &self,
        competition_id: CompetitionId,
        number: u32,
        started_at: DateTime<Utc>,
    ) -> Result<Round, StoreError>;

    async fn set_round_total(
        &self,
        competition_id: CompetitionId,
        number: u32,
        total_tasks: u32,
    ) -> Result<(), StoreError>;

    async fn set_round_judged(
        &self,
        competition_id: CompetitionId,
        number: u32,
        judged_tasks: u32,
    ) -> Result<(), StoreError>;

    async fn complete_round(
        &self,
        competition_id: CompetitionId,
        number: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn has_attack_result(
        &self,
        competition_id: CompetitionId,
        round: u32,
        team_id: TeamId,
        challenge_id: ChallengeId,
    ) -> Result<bool, StoreError>;

    /// Inserts the result unless one already exists for the (team, challenge, round). Returns
    /// whether the result was inserted.
    async fn insert_attack_result(&self, result: AttackResult) -> Result<bool, StoreError>;

    async fn attack_results(
        &self,
        competition_id: CompetitionId,
        round: u32,
    ) -> Result<Vec<AttackResult>, StoreError>;
}
