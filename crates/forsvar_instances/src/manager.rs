// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::flags::{self, CREDENTIAL_ENV};
use crate::metrics::InstanceMetrics;
use crate::runtime::{ContainerRuntime, ContainerSpec, Limits, PortBinding, RuntimeError};
use chrono::Utc;
use dashmap::DashMap;
use forsvar_common::config::InstancesConfig;
use forsvar_common::models::ports::{encode_port_block, parse_port_block};
use forsvar_common::models::{
    Challenge, ChallengeId, Competition, CompetitionId, CompetitionMode, Instance, InstanceStatus,
    NewInstance, PortMap, TeamId,
};
use forsvar_common::store::{InstanceFilter, Store, StoreError};
use forsvar_common::utils::time::interval_duration;
use forsvar_ports::{PortAllocator, PortError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const LABEL_MANAGED: &str = "forsvar.managed";
const LABEL_COMPETITION: &str = "forsvar.competition";
const LABEL_CHALLENGE: &str = "forsvar.challenge";
const LABEL_TEAM: &str = "forsvar.team";

#[derive(thiserror::Error, Debug)]
pub enum InstanceError {
    #[error("challenge {challenge_id} is misconfigured: {reason}")]
    ChallengeMisconfigured {
        challenge_id: ChallengeId,
        reason: &'static str,
    },
    #[error("competition {0} is not running")]
    ContestNotRunning(CompetitionId),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("team {0} is not approved for the competition")]
    TeamNotApproved(TeamId),
    #[error("port allocation error: {0}")]
    Ports(#[from] PortError),
    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created: usize,
    /// Pairs that already had a running instance
    pub existing: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub destroyed: usize,
    /// Instances whose container could not be removed. They stay `running` so that the expiry
    /// sweep retries them.
    pub failed: usize,
}

pub struct InstanceManager {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    config: InstancesConfig,
    pub(crate) metrics: InstanceMetrics,
    /// Serializes creations and destructions of the same (team, challenge) pair
    pair_locks: DashMap<(TeamId, ChallengeId), Arc<Mutex<()>>>,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        config: InstancesConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            ports,
            config,
            metrics: InstanceMetrics::default(),
            pair_locks: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> &InstanceMetrics {
        &self.metrics
    }

    /// Reserves a port block for every approved team and creates one instance per (team, public
    /// challenge) pair. Instances are created one at a time; a failing pair is logged and skipped.
    pub async fn provision_for_competition_start(
        &self,
        competition_id: CompetitionId,
    ) -> Result<ProvisionReport, InstanceError> {
        let competition = self
            .store
            .competition(competition_id)
            .await?
            .ok_or(InstanceError::NotFound("competition"))?;
        if !competition.is_running() {
            return Err(InstanceError::ContestNotRunning(competition_id));
        }

        let teams = self.store.approved_teams(competition_id).await?;
        let challenges = self.instantiable_challenges(competition_id).await?;
        info!(
            competition_id,
            teams = teams.len(),
            challenges = challenges.len(),
            "provisioning instances"
        );

        let block_size = challenges
            .iter()
            .map(|challenge| challenge.ports.len())
            .max()
            .unwrap_or(0)
            * self.config.per_team_instance_limit.max(1);
        self.reserve_port_blocks(competition_id, &teams, block_size)
            .await;

        let mut report = ProvisionReport::default();
        for team_id in &teams {
            for challenge in &challenges {
                self.provision_pair(&competition, challenge, *team_id, &mut report)
                    .await;
            }
        }

        info!(
            competition_id,
            created = report.created,
            existing = report.existing,
            failed = report.failed,
            "provisioning complete"
        );
        Ok(report)
    }

    /// Creates an instance of a challenge that was made public mid-competition for every
    /// approved team. Does nothing if the competition isn't running.
    pub async fn provision_for_challenge_activation(
        &self,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> Result<ProvisionReport, InstanceError> {
        let competition = self
            .store
            .competition(competition_id)
            .await?
            .ok_or(InstanceError::NotFound("competition"))?;
        if !competition.is_running() {
            debug!(
                competition_id,
                challenge_id, "competition is not running, skipping provisioning"
            );
            return Ok(ProvisionReport::default());
        }

        let challenge = self.challenge_of(competition_id, challenge_id).await?;
        if challenge.image.is_none() {
            return Err(InstanceError::ChallengeMisconfigured {
                challenge_id,
                reason: "no image",
            });
        }

        let teams = self.store.approved_teams(competition_id).await?;
        let mut report = ProvisionReport::default();
        for team_id in &teams {
            self.provision_pair(&competition, &challenge, *team_id, &mut report)
                .await;
        }

        info!(
            competition_id,
            challenge_id,
            created = report.created,
            existing = report.existing,
            failed = report.failed,
            "challenge provisioning complete"
        );
        Ok(report)
    }

    pub async fn teardown_for_challenge(
        &self,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> Result<TeardownReport, InstanceError> {
        let filter = InstanceFilter::running()
            .competition(competition_id)
            .challenge(challenge_id);
        self.teardown(&filter).await
    }

    pub async fn teardown_for_competition(
        &self,
        competition_id: CompetitionId,
    ) -> Result<TeardownReport, InstanceError> {
        let filter = InstanceFilter::running().competition(competition_id);
        self.teardown(&filter).await
    }

    /// Replaces the team's instance with a fresh one that carries the same flag. Patches that the
    /// team recorded for the instance are discarded.
    pub async fn reset(
        &self,
        team_id: TeamId,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> Result<PortMap, InstanceError> {
        let (competition, challenge) = self
            .validate_request(team_id, competition_id, challenge_id)
            .await?;

        let lock = self.pair_lock(team_id, challenge_id);
        let _guard = lock.lock().await;

        let flag = match self.active_instance(team_id, challenge_id).await? {
            Some(existing) => {
                self.destroy(&existing).await?;
                Some(existing.flag)
            }
            None => None,
        };
        let deleted = self.store.delete_patches(team_id, challenge_id).await?;
        let instance = self
            .create_instance(&competition, &challenge, team_id, flag)
            .await?;

        info!(
            team_id,
            challenge_id,
            instance_id = instance.id,
            patches_deleted = deleted,
            "instance reset"
        );
        Ok(instance.port_map())
    }

    /// Starts an instance on behalf of a player. An already running instance is returned as is.
    pub async fn launch(
        &self,
        team_id: TeamId,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> Result<Instance, InstanceError> {
        let (competition, challenge) = self
            .validate_request(team_id, competition_id, challenge_id)
            .await?;

        let lock = self.pair_lock(team_id, challenge_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.active_instance(team_id, challenge_id).await? {
            return Ok(existing);
        }
        self.create_instance(&competition, &challenge, team_id, None)
            .await
    }

    async fn validate_request(
        &self,
        team_id: TeamId,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> Result<(Competition, Challenge), InstanceError> {
        let competition = self
            .store
            .competition(competition_id)
            .await?
            .ok_or(InstanceError::NotFound("competition"))?;
        if !competition.is_running() {
            return Err(InstanceError::ContestNotRunning(competition_id));
        }

        let challenge = self.challenge_of(competition_id, challenge_id).await?;
        if challenge.image.is_none() {
            return Err(InstanceError::ChallengeMisconfigured {
                challenge_id,
                reason: "no image",
            });
        }

        let teams = self.store.approved_teams(competition_id).await?;
        if !teams.contains(&team_id) {
            return Err(InstanceError::TeamNotApproved(team_id));
        }
        Ok((competition, challenge))
    }

    async fn challenge_of(
        &self,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
    ) -> Result<Challenge, InstanceError> {
        self.store
            .challenge(challenge_id)
            .await?
            .filter(|challenge| challenge.competition_id == competition_id)
            .ok_or(InstanceError::NotFound("challenge"))
    }

    async fn instantiable_challenges(
        &self,
        competition_id: CompetitionId,
    ) -> Result<Vec<Challenge>, InstanceError> {
        let challenges = self.store.challenges(competition_id).await?;
        Ok(challenges
            .into_iter()
            .filter(|challenge| challenge.is_public())
            .filter(|challenge| {
                if challenge.image.is_none() {
                    warn!(
                        challenge_id = challenge.id,
                        "public challenge has no image, skipping"
                    );
                    return false;
                }
                true
            })
            .collect())
    }

    async fn active_instance(
        &self,
        team_id: TeamId,
        challenge_id: ChallengeId,
    ) -> Result<Option<Instance>, InstanceError> {
        let filter = InstanceFilter::running()
            .team(team_id)
            .challenge(challenge_id);
        Ok(self.store.instances(&filter).await?.into_iter().next())
    }

    fn pair_lock(&self, team_id: TeamId, challenge_id: ChallengeId) -> Arc<Mutex<()>> {
        self.pair_locks
            .entry((team_id, challenge_id))
            .or_default()
            .clone()
    }

    async fn provision_pair(
        &self,
        competition: &Competition,
        challenge: &Challenge,
        team_id: TeamId,
        report: &mut ProvisionReport,
    ) {
        if report.created + report.failed > 0 {
            // Throttle to avoid overwhelming the container runtime
            tokio::time::sleep(self.config.creation_pause()).await;
        }

        let lock = self.pair_lock(team_id, challenge.id);
        let _guard = lock.lock().await;

        let result = match self.active_instance(team_id, challenge.id).await {
            Ok(Some(_)) => Ok(None),
            Ok(None) => self
                .create_instance(competition, challenge, team_id, None)
                .await
                .map(Some),
            Err(error) => Err(error),
        };

        match result {
            Ok(Some(instance)) => {
                report.created += 1;
                debug!(
                    team_id,
                    challenge_id = challenge.id,
                    instance_id = instance.id,
                    "instance provisioned"
                );
            }
            Ok(None) => report.existing += 1,
            Err(error) => {
                report.failed += 1;
                warn! {
                    ?error,
                    team_id,
                    challenge_id = challenge.id,
                    "unable to provision instance"
                }
            }
        }
    }

    async fn reserve_port_blocks(
        &self,
        competition_id: CompetitionId,
        teams: &[TeamId],
        block_size: usize,
    ) {
        if block_size == 0 {
            return;
        }
        for team_id in teams {
            let existing = match self.store.team_port_block(competition_id, *team_id).await {
                Ok(block) => block.map(|block| parse_port_block(&block)).unwrap_or_default(),
                Err(error) => {
                    warn! {
                        ?error,
                        team_id,
                        "unable to read the team port block"
                    }
                    continue;
                }
            };
            if existing.len() >= block_size {
                continue;
            }

            match self.ports.allocate_batch(block_size).await {
                Ok(block) => {
                    if let Err(error) = self
                        .store
                        .put_team_port_block(competition_id, *team_id, encode_port_block(&block))
                        .await
                    {
                        warn! {
                            ?error,
                            team_id,
                            "unable to record the team port block"
                        }
                    }
                }
                Err(error) => {
                    warn! {
                        ?error,
                        team_id,
                        "unable to reserve a port block, instances will allocate ports on creation"
                    }
                }
            }
        }
    }

    async fn teardown(&self, filter: &InstanceFilter) -> Result<TeardownReport, InstanceError> {
        let instances = self.store.instances(filter).await?;
        let mut report = TeardownReport::default();
        for instance in instances {
            let lock = self.pair_lock(instance.team_id, instance.challenge_id);
            let _guard = lock.lock().await;
            match self.destroy(&instance).await {
                Ok(()) => report.destroyed += 1,
                Err(error) => {
                    report.failed += 1;
                    warn! {
                        ?error,
                        instance_id = instance.id,
                        container_id = instance.container_id,
                        "unable to destroy instance"
                    }
                }
            }
        }
        info!(
            destroyed = report.destroyed,
            failed = report.failed,
            "teardown complete"
        );
        Ok(report)
    }

    async fn destroy(&self, instance: &Instance) -> Result<(), InstanceError> {
        if let Err(error) = self.runtime.remove(&instance.container_id).await {
            self.metrics.destroy_errors.inc();
            return Err(error.into());
        }
        self.store
            .transition_instance(instance.id, InstanceStatus::Running, InstanceStatus::Destroyed)
            .await?;
        self.metrics.destroyed.inc();
        Ok(())
    }

    async fn create_instance(
        &self,
        competition: &Competition,
        challenge: &Challenge,
        team_id: TeamId,
        flag: Option<String>,
    ) -> Result<Instance, InstanceError> {
        let start = Instant::now();
        let result = self
            .create_container(competition, challenge, team_id, flag)
            .await;
        match &result {
            Ok(_) => {
                self.metrics.created.inc();
                self.metrics
                    .create_duration
                    .observe(start.elapsed().as_secs_f64());
            }
            Err(_) => {
                self.metrics.create_errors.inc();
            }
        }
        result
    }

    async fn create_container(
        &self,
        competition: &Competition,
        challenge: &Challenge,
        team_id: TeamId,
        flag: Option<String>,
    ) -> Result<Instance, InstanceError> {
        let image = challenge
            .image
            .clone()
            .ok_or(InstanceError::ChallengeMisconfigured {
                challenge_id: challenge.id,
                reason: "no image",
            })?;
        if competition.mode == CompetitionMode::AttackDefense && challenge.ports.is_empty() {
            return Err(InstanceError::ChallengeMisconfigured {
                challenge_id: challenge.id,
                reason: "no ports",
            });
        }

        let host_ports = self
            .resolve_host_ports(competition.id, challenge, team_id)
            .await?;
        let bindings = challenge
            .ports
            .iter()
            .enumerate()
            .map(|(idx, container_port)| PortBinding {
                container_port: *container_port,
                host_port: host_ports.as_ref().and_then(|ports| ports.get(idx).copied()),
            })
            .collect();

        let flag = flag.unwrap_or_else(|| flags::generate_flag(challenge));
        let credential = flags::generate_credential();
        let injection = flags::flag_injection(challenge, &flag);
        let mut env = injection.env;
        env.insert(CREDENTIAL_ENV.to_string(), credential.clone());

        let spec = ContainerSpec {
            name: self.container_name(competition.id, challenge.id, team_id),
            image,
            ports: bindings,
            limits: self.limits_for(challenge),
            env,
            args: injection.args,
            labels: BTreeMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_COMPETITION.to_string(), competition.id.to_string()),
                (LABEL_CHALLENGE.to_string(), challenge.id.to_string()),
                (LABEL_TEAM.to_string(), team_id.to_string()),
            ]),
        };

        // Nothing has been persisted yet, a failure here needs no cleanup
        let container_id = self.runtime.run(&spec).await?;

        let ports: PortMap = match host_ports {
            Some(host_ports) => challenge.ports.iter().copied().zip(host_ports).collect(),
            None => match self.runtime.published_ports(&container_id).await {
                Ok(ports) => ports,
                Err(error) => {
                    self.remove_orphan(&container_id).await;
                    return Err(error.into());
                }
            },
        };

        if let Some(script) = &challenge.flag_script {
            self.run_flag_script(&container_id, script, &flag).await;
        }

        let expires_at = match competition.mode {
            CompetitionMode::OnDemand => Utc::now() + interval_duration(self.config.ttl),
            CompetitionMode::AttackDefense => competition.end_time,
        };
        let new_instance = NewInstance {
            team_id,
            challenge_id: challenge.id,
            competition_id: competition.id,
            mode: competition.mode,
            container_id: container_id.clone(),
            ports,
            credential,
            flag,
            expires_at,
        };

        match self.store.upsert_instance(new_instance).await {
            Ok(instance) => Ok(instance),
            Err(error) => {
                // An unrecorded container would never be cleaned up
                self.remove_orphan(&container_id).await;
                Err(error.into())
            }
        }
    }

    /// Picks host ports for the challenge's container ports. `None` lets the container runtime
    /// assign ephemeral ports.
    async fn resolve_host_ports(
        &self,
        competition_id: CompetitionId,
        challenge: &Challenge,
        team_id: TeamId,
    ) -> Result<Option<Vec<u16>>, InstanceError> {
        let needed = challenge.ports.len();
        if needed == 0 {
            return Ok(Some(Vec::new()));
        }

        if let Some(block) = self.store.team_port_block(competition_id, team_id).await? {
            let in_use: HashSet<u16> = self
                .store
                .instances(&InstanceFilter::running().team(team_id))
                .await?
                .iter()
                .flat_map(|instance| instance.port_map().into_values())
                .collect();
            let free: Vec<u16> = parse_port_block(&block)
                .into_iter()
                .filter(|port| !in_use.contains(port))
                .take(needed)
                .collect();
            if free.len() == needed {
                return Ok(Some(free));
            }
        }

        match self.ports.allocate_batch(needed).await {
            Ok(ports) => Ok(Some(ports)),
            Err(PortError::InsufficientPorts {
                requested,
                available,
            }) => {
                warn!(
                    team_id,
                    challenge_id = challenge.id,
                    requested,
                    available,
                    "port range exhausted, falling back to runtime assigned ports"
                );
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn limits_for(&self, challenge: &Challenge) -> Option<Limits> {
        let resources = &challenge.resources;
        if resources.is_declared() {
            return Some(Limits {
                cpu: resources.cpu,
                memory: resources.memory.clone(),
            });
        }
        if resources.unlimited {
            return None;
        }
        if self.config.default_cpu.is_none() && self.config.default_memory.is_none() {
            return None;
        }
        Some(Limits {
            cpu: self.config.default_cpu,
            memory: self.config.default_memory.clone(),
        })
    }

    fn container_name(
        &self,
        competition_id: CompetitionId,
        challenge_id: ChallengeId,
        team_id: TeamId,
    ) -> String {
        let suffix: u32 = rand::random::<u32>() & 0xffffff;
        format!(
            "{}-{competition_id}-{challenge_id}-{team_id}-{suffix:06x}",
            self.config.container_prefix
        )
    }

    /// Runs the challenge's flag script inside the container. Failures are logged only.
    async fn run_flag_script(&self, container_id: &str, script: &str, flag: &str) {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let env = BTreeMap::from([(flags::DEFAULT_FLAG_ENV.to_string(), flag.to_string())]);
        match self.runtime.exec(container_id, &command, &env).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!(
                    container_id,
                    exit_code = ?output.exit_code,
                    stderr = output.stderr.trim(),
                    "flag script failed"
                );
            }
            Err(error) => {
                warn! {
                    ?error,
                    container_id,
                    "unable to run the flag script"
                }
            }
        }
    }

    pub(crate) async fn remove_orphan(&self, container_id: &str) {
        if let Err(error) = self.runtime.remove(container_id).await {
            error! {
                ?error,
                container_id,
                "unable to remove orphaned container"
            }
        }
    }
}
