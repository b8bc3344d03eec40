// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

//! This module contains shared models that are used across the components and the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

pub mod ports;

pub use ports::PortMap;

pub type CompetitionId = i64;
pub type ChallengeId = i64;
pub type TeamId = i64;
pub type InstanceId = i64;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionStatus {
    Pending,
    Running,
    Paused,
    Ended,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionMode {
    /// Players launch single challenge instances on demand. Instances live for a fixed time window.
    OnDemand,
    /// Every approved team gets an instance of every public challenge and is judged in rounds.
    AttackDefense,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Competition {
    pub id: CompetitionId,
    pub name: String,
    pub status: CompetitionStatus,
    pub mode: CompetitionMode,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// The round length in seconds
    #[serde(default)]
    pub defense_interval: Option<u64>,
    /// The maximum amount of judging tasks executing at the same time within a round
    #[serde(default)]
    pub judge_concurrency: Option<usize>,
}

impl Competition {
    pub fn is_running(&self) -> bool {
        self.status == CompetitionStatus::Running
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeVisibility {
    #[default]
    Hidden,
    Public,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceLimits {
    /// The amount of CPUs, e.g. `0.5`
    #[serde(default)]
    pub cpu: Option<f64>,
    /// The memory limit in the container runtime's notation, e.g. `256m`
    #[serde(default)]
    pub memory: Option<String>,
    /// Explicitly run the container without any resource limits
    #[serde(default)]
    pub unlimited: bool,
}

impl ResourceLimits {
    pub fn is_declared(&self) -> bool {
        self.cpu.is_some() || self.memory.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Challenge {
    pub id: ChallengeId,
    pub competition_id: CompetitionId,
    pub name: String,
    #[serde(default)]
    pub visibility: ChallengeVisibility,
    /// The container image. Challenges without an image cannot be instantiated.
    #[serde(default)]
    pub image: Option<String>,
    /// The ports exposed by the container. The first port is the service port targeted by judging.
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub attack_script: Option<String>,
    #[serde(default)]
    pub check_script: Option<String>,
    /// A static flag. A random flag is generated per team if omitted.
    #[serde(default)]
    pub flag: Option<String>,
    /// The environment variables that receive the flag
    #[serde(default)]
    pub flag_env: Vec<String>,
    /// A script executed inside the container after it has started
    #[serde(default)]
    pub flag_script: Option<String>,
    /// Points awarded for each successfully defended round
    #[serde(default)]
    pub defense_award: i64,
}

impl Challenge {
    pub fn is_public(&self) -> bool {
        self.visibility == ChallengeVisibility::Public
    }

    pub fn service_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct TeamMembership {
    pub team_id: TeamId,
    pub competition_id: CompetitionId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub approved: bool,
}

#[derive(Debug, Serialize_repr, Deserialize_repr, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceStatus {
    Running = 0,
    Expired = 1,
    Destroyed = 2,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Instance {
    pub id: InstanceId,
    pub team_id: TeamId,
    pub challenge_id: ChallengeId,
    pub competition_id: CompetitionId,
    pub mode: CompetitionMode,
    pub container_id: String,
    /// The published port map in its serialized form, see [ports::parse_port_map]
    pub ports: String,
    /// The access secret for auxiliary channels such as a remote shell
    pub credential: String,
    pub flag: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Instance {
    pub fn port_map(&self) -> PortMap {
        ports::parse_port_map(&self.ports)
    }

    /// The host port that the given container port is published on
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.port_map().get(&container_port).copied()
    }
}

/// The data required to record a freshly created instance
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub team_id: TeamId,
    pub challenge_id: ChallengeId,
    pub competition_id: CompetitionId,
    pub mode: CompetitionMode,
    pub container_id: String,
    pub ports: PortMap,
    pub credential: String,
    pub flag: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize_repr, Deserialize_repr, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoundStatus {
    Running = 0,
    Completed = 1,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Round {
    pub competition_id: CompetitionId,
    pub number: u32,
    pub status: RoundStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub judged_tasks: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct AttackResult {
    pub competition_id: CompetitionId,
    pub round: u32,
    pub team_id: TeamId,
    pub challenge_id: ChallengeId,
    pub attack_success: bool,
    pub check_success: bool,
    pub defense_success: bool,
    pub score: i64,
    pub attack_output: String,
    pub check_output: String,
    pub created_at: DateTime<Utc>,
}

/// A team defends a round if the attack failed while the service stayed functional. A challenge
/// without a health check counts as functional.
pub fn defense_success(attack_success: bool, check_success: Option<bool>) -> bool {
    !attack_success && check_success.unwrap_or(true)
}

/// A recorded modification that a team applied to its instance
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Patch {
    pub team_id: TeamId,
    pub challenge_id: ChallengeId,
    pub created_at: DateTime<Utc>,
    pub description: String,
}

/// Fired once a round has been completed and the totals changed
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScoreChanged {
    pub competition_id: CompetitionId,
    pub round: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_defend_only_when_attack_failed_and_check_passed() {
        let cases = [
            (false, Some(true), true),
            (false, Some(false), false),
            (true, Some(true), false),
            (true, Some(false), false),
        ];
        for (attack, check, expected) in cases {
            assert_eq!(
                defense_success(attack, check),
                expected,
                "attack={attack} check={check:?}"
            );
        }
    }

    #[test]
    fn should_treat_missing_check_as_passed() {
        assert!(defense_success(false, None));
        assert!(!defense_success(true, None));
    }

    #[test]
    fn should_deserialize_challenge_with_defaults() {
        let challenge: Challenge = toml::from_str(
            r#"
            id = 3
            competition_id = 1
            name = "web"
            image = "registry.local/web:latest"
            ports = [8080, 22]
            "#,
        )
        .unwrap();
        assert_eq!(challenge.visibility, ChallengeVisibility::Hidden);
        assert_eq!(challenge.service_port(), Some(8080));
        assert!(!challenge.resources.is_declared());
        assert!(challenge.flag_env.is_empty());
    }
}
