// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::models::{Challenge, Competition, TeamMembership};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port range: {start}..{end}, the start must be below the end")]
    InvalidPortRange { start: u16, end: u16 },
}

/// The application config file
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub instances: InstancesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Competitions to seed the in-memory store with
    #[serde(default)]
    pub competitions: Vec<Competition>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub teams: Vec<TeamMembership>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ports.validate()
    }
}

/// The range of host ports that may be handed out to instances. The end is inclusive.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PortsConfig {
    pub start: u16,
    pub end: u16,
}

impl PortsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start == 0 || self.start >= self.end {
            return Err(ConfigError::InvalidPortRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 30000,
            end: 40000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct InstancesConfig {
    /// The container runtime command, e.g. `docker` or `podman`
    pub runtime: String,
    /// Timeout in seconds for a single container runtime command
    pub command_timeout: u64,
    /// The lifetime in seconds of on-demand instances
    pub ttl: u64,
    /// Pause in milliseconds between serial instance creations
    pub creation_pause_ms: u64,
    /// The amount of instances a team may hold at once. Used to size the reserved port blocks.
    pub per_team_instance_limit: usize,
    /// CPU limit applied to challenges that don't declare any limits
    pub default_cpu: Option<f64>,
    /// Memory limit applied to challenges that don't declare any limits
    pub default_memory: Option<String>,
    /// Interval in seconds between expiry sweeps
    pub sweep_interval: u64,
    /// Prefix of the container names
    pub container_prefix: String,
}

impl InstancesConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn creation_pause(&self) -> Duration {
        Duration::from_millis(self.creation_pause_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            command_timeout: 60,
            ttl: 3600,
            creation_pause_ms: 500,
            per_team_instance_limit: 1,
            default_cpu: Some(1.0),
            default_memory: Some("512m".to_string()),
            sweep_interval: 30,
            container_prefix: "forsvar".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct SchedulerConfig {
    /// Round length in seconds for competitions that don't configure one
    pub default_interval: u64,
    /// Judging concurrency for competitions that don't configure one
    pub default_concurrency: usize,
    /// Timeout in seconds for attack scripts
    pub attack_timeout: u64,
    /// Timeout in seconds for health check scripts
    pub check_timeout: u64,
    /// The host that the published instance ports are reachable on
    pub target_host: String,
    /// The interpreter that scripts are passed to with `-c`
    pub interpreter: String,
    /// The amount of script output bytes kept per result
    pub output_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval: 300,
            default_concurrency: 5,
            attack_timeout: 30,
            check_timeout: 10,
            target_host: "127.0.0.1".to_string(),
            interpreter: "sh".to_string(),
            output_limit: 4096,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct ControllerConfig {
    /// Interval in seconds between competition time window checks
    pub watch_interval: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { watch_interval: 5 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_minimal_config_with_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [ports]
            start = 31000
            end = 31100
            "#,
        )
        .unwrap();
        assert_eq!(config.ports.start, 31000);
        assert_eq!(config.instances.runtime, "docker");
        assert_eq!(config.scheduler.default_interval, 300);
        assert_eq!(config.controller.watch_interval, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_reject_inverted_port_range() {
        let ports = PortsConfig {
            start: 40000,
            end: 30000,
        };
        assert_eq!(
            ports.validate(),
            Err(ConfigError::InvalidPortRange {
                start: 40000,
                end: 30000
            })
        );
    }

    #[test]
    fn should_parse_seed_data() {
        let config: AppConfig = toml::from_str(
            r#"
            [[competitions]]
            id = 1
            name = "finals"
            status = "pending"
            mode = "attack_defense"
            start_time = "2024-01-01T08:00:00Z"
            end_time = "2024-01-01T16:00:00Z"
            defense_interval = 60

            [[challenges]]
            id = 1
            competition_id = 1
            name = "notes"
            visibility = "public"
            image = "notes:latest"
            ports = [5000]
            attack_script = "exit 1"
            defense_award = 10

            [[teams]]
            team_id = 1
            competition_id = 1
            approved = true
            "#,
        )
        .unwrap();
        assert_eq!(config.competitions[0].defense_interval, Some(60));
        assert!(config.challenges[0].is_public());
        assert!(config.teams[0].approved);
    }
}
