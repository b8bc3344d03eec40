// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::judge::{Judge, JudgeError, JudgeTask, ScriptOutcome, Verdict};
use async_trait::async_trait;
use forsvar_common::config::SchedulerConfig;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

const ENV_TARGET_HOST: &str = "TARGET_HOST";
const ENV_TARGET_PORT: &str = "TARGET_PORT";
const ENV_TEAM_ID: &str = "TEAM_ID";
const ENV_CHALLENGE_ID: &str = "CHALLENGE_ID";
const ENV_ROUND: &str = "ROUND";
const ENV_FLAG: &str = "FLAG";

/// Runs the challenge's attack and health check scripts through a shell. A script succeeds if it
/// exits with zero before its timeout.
#[derive(Debug, Clone)]
pub struct ScriptJudge {
    pub interpreter: String,
    pub target_host: String,
    pub attack_timeout: Duration,
    pub check_timeout: Duration,
    /// The amount of output bytes kept per script
    pub output_limit: usize,
}

impl ScriptJudge {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            target_host: config.target_host.clone(),
            attack_timeout: Duration::from_secs(config.attack_timeout),
            check_timeout: Duration::from_secs(config.check_timeout),
            output_limit: config.output_limit,
        }
    }

    async fn run_script(
        &self,
        script: &str,
        env: &BTreeMap<&'static str, String>,
        timeout: Duration,
    ) -> Result<ScriptOutcome, JudgeError> {
        let mut command = Command::new(&self.interpreter);
        command.arg("-c").arg(script);
        command.envs(env.iter().map(|(key, value)| (*key, value.as_str())));
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let start = tokio::time::Instant::now();
        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            tokio::try_join!(
                read_capped(stdout, self.output_limit),
                read_capped(stderr, self.output_limit),
                child.wait()
            )
        };

        // The child is killed on drop if it outlives the timeout
        match tokio::time::timeout(timeout, run).await {
            Ok(result) => {
                let (stdout, stderr, status) = result?;
                debug!("script exited with {} after {:?}", status, start.elapsed());
                let mut text = String::from_utf8_lossy(&stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&stderr));
                Ok(ScriptOutcome {
                    success: status.success(),
                    output: truncate(text, self.output_limit),
                })
            }
            Err(_) => Ok(ScriptOutcome {
                success: false,
                output: format!("timed out after {timeout:?}"),
            }),
        }
    }
}

#[async_trait]
impl Judge for ScriptJudge {
    async fn judge(&self, task: &JudgeTask) -> Result<Verdict, JudgeError> {
        let challenge = &task.challenge;
        let attack_script = challenge
            .attack_script
            .as_deref()
            .ok_or(JudgeError::MissingAttackScript(challenge.id))?;
        let service_port = challenge
            .service_port()
            .ok_or(JudgeError::NoServicePort(challenge.id))?;
        let target_port =
            task.instance
                .host_port(service_port)
                .ok_or(JudgeError::NoPublishedPort {
                    instance_id: task.instance.id,
                    port: service_port,
                })?;

        let env = BTreeMap::from([
            (ENV_TARGET_HOST, self.target_host.clone()),
            (ENV_TARGET_PORT, target_port.to_string()),
            (ENV_TEAM_ID, task.instance.team_id.to_string()),
            (ENV_CHALLENGE_ID, challenge.id.to_string()),
            (ENV_ROUND, task.round.to_string()),
            (ENV_FLAG, task.instance.flag.clone()),
        ]);

        let attack = self
            .run_script(attack_script, &env, self.attack_timeout)
            .await?;
        let check = match &challenge.check_script {
            Some(script) => Some(self.run_script(script, &env, self.check_timeout).await?),
            None => None,
        };
        Ok(Verdict { attack, check })
    }
}

/// Keeps the first `limit` bytes of the stream and discards the rest, so that a chatty script
/// never blocks on a full pipe
async fn read_capped<R>(reader: Option<R>, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buffer = Vec::new();
    (&mut reader)
        .take(limit as u64)
        .read_to_end(&mut buffer)
        .await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(buffer)
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forsvar_common::models::{
        Challenge, ChallengeVisibility, CompetitionMode, Instance, InstanceStatus,
    };
    use std::sync::Arc;

    fn judge(attack_timeout: Duration) -> ScriptJudge {
        ScriptJudge {
            interpreter: "sh".to_string(),
            target_host: "10.0.0.1".to_string(),
            attack_timeout,
            check_timeout: Duration::from_secs(5),
            output_limit: 64,
        }
    }

    fn task(attack: &str, check: Option<&str>, ports: &str) -> JudgeTask {
        let challenge = Challenge {
            id: 7,
            competition_id: 1,
            name: "notes".to_string(),
            visibility: ChallengeVisibility::Public,
            image: Some("notes:latest".to_string()),
            ports: vec![80],
            resources: Default::default(),
            attack_script: Some(attack.to_string()),
            check_script: check.map(str::to_string),
            flag: None,
            flag_env: Vec::new(),
            flag_script: None,
            defense_award: 10,
        };
        let instance = Instance {
            id: 3,
            team_id: 2,
            challenge_id: 7,
            competition_id: 1,
            mode: CompetitionMode::AttackDefense,
            container_id: "container".to_string(),
            ports: ports.to_string(),
            credential: String::new(),
            flag: "flag{abc}".to_string(),
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        JudgeTask {
            competition_id: 1,
            round: 4,
            challenge: Arc::new(challenge),
            instance,
        }
    }

    #[tokio::test]
    async fn should_pass_target_to_scripts() {
        let verdict = judge(Duration::from_secs(5))
            .judge(&task(
                r#"test "$TARGET_HOST:$TARGET_PORT" = "10.0.0.1:30005" && test "$ROUND" = 4"#,
                Some(r#"echo "$FLAG"; exit 1"#),
                r#"{"80":30005}"#,
            ))
            .await
            .unwrap();
        assert!(verdict.attack.success);
        let check = verdict.check.unwrap();
        assert!(!check.success);
        assert_eq!(check.output.trim(), "flag{abc}");
    }

    #[tokio::test]
    async fn should_treat_timeout_as_failed_attack() {
        let verdict = judge(Duration::from_millis(100))
            .judge(&task("sleep 5", None, r#"{"80":30005}"#))
            .await
            .unwrap();
        assert!(!verdict.attack.success);
        assert!(verdict.attack.output.contains("timed out"));
        assert!(verdict.check.is_none());
    }

    #[tokio::test]
    async fn should_fail_without_published_service_port() {
        let result = judge(Duration::from_secs(5))
            .judge(&task("exit 0", None, r#"{"22":30005}"#))
            .await;
        assert!(matches!(
            result,
            Err(JudgeError::NoPublishedPort { port: 80, .. })
        ));
    }

    #[tokio::test]
    async fn should_limit_output() {
        let verdict = judge(Duration::from_secs(5))
            .judge(&task("yes | head -c 1000", None, r#"{"80":30005}"#))
            .await
            .unwrap();
        assert_eq!(verdict.attack.output.len(), 64);
    }

    #[tokio::test]
    async fn should_drain_output_beyond_limit() {
        let verdict = judge(Duration::from_secs(5))
            .judge(&task(
                "head -c 2000000 /dev/zero; head -c 2000000 /dev/zero >&2; exit 0",
                None,
                r#"{"80":30005}"#,
            ))
            .await
            .unwrap();
        assert!(verdict.attack.success);
        assert_eq!(verdict.attack.output.len(), 64);
    }

    #[tokio::test]
    async fn should_keep_only_the_first_bytes_of_a_stream() {
        let input: &[u8] = b"0123456789";
        let buffer = read_capped(Some(input), 4).await.unwrap();
        assert_eq!(buffer, b"0123");
        let empty = read_capped(None::<&[u8]>, 4).await.unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn should_truncate_on_char_boundary() {
        assert_eq!(truncate("æøå".to_string(), 3), "æ");
        assert_eq!(truncate("abc".to_string(), 10), "abc");
    }
}
