// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

mod script;

pub use script::ScriptJudge;

use async_trait::async_trait;
use forsvar_common::models::{Challenge, ChallengeId, CompetitionId, Instance, InstanceId};
use std::sync::Arc;

/// Failures of the judging infrastructure. A failing or hanging script is an outcome, not an error.
#[derive(thiserror::Error, Debug)]
pub enum JudgeError {
    #[error("challenge {0} has no attack script")]
    MissingAttackScript(ChallengeId),
    #[error("challenge {0} declares no service port")]
    NoServicePort(ChallengeId),
    #[error("instance {instance_id} doesn't publish port {port}")]
    NoPublishedPort { instance_id: InstanceId, port: u16 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One (team, challenge) pair to judge within a round
#[derive(Debug, Clone)]
pub struct JudgeTask {
    pub competition_id: CompetitionId,
    pub round: u32,
    pub challenge: Arc<Challenge>,
    pub instance: Instance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub attack: ScriptOutcome,
    /// `None` if the challenge has no health check
    pub check: Option<ScriptOutcome>,
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, task: &JudgeTask) -> Result<Verdict, JudgeError>;
}
