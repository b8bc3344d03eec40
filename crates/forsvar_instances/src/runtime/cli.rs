// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeError};
use async_trait::async_trait;
use forsvar_common::models::PortMap;
use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Drives a docker compatible command line client, e.g. `docker` or `podman`.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
    timeout: Duration,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn command(&self, args: Vec<String>) -> Result<Output, RuntimeError> {
        debug!("running: {} {}", &self.binary, args.join(" "));
        let mut command = Command::new(&self.binary);
        command.args(&args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        // The child is killed if the timeout drops the future
        command.kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(RuntimeError::Timeout(self.timeout)),
        }
    }

    async fn checked_command(&self, args: Vec<String>) -> Result<Output, RuntimeError> {
        let output = self.command(args).await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn run(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let output = self.checked_command(run_args(spec)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Image pull progress may precede the id
        let id = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| RuntimeError::Parse("no container id in output".to_string()))?;
        Ok(id.to_string())
    }

    async fn published_ports(&self, container_id: &str) -> Result<PortMap, RuntimeError> {
        let output = self
            .checked_command(vec!["port".to_string(), container_id.to_string()])
            .await?;
        Ok(parse_port_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(container_id.to_string());
        args.extend(command.iter().cloned());

        let output = self.command(args).await?;
        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let args = vec!["rm".to_string(), "-f".to_string(), container_id.to_string()];
        match self.checked_command(args).await {
            Err(RuntimeError::CommandFailed { stderr, .. })
                if stderr.to_lowercase().contains("no such container") =>
            {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for binding in &spec.ports {
        args.push("-p".to_string());
        args.push(match binding.host_port {
            Some(host_port) => format!("{host_port}:{}", binding.container_port),
            None => binding.container_port.to_string(),
        });
    }
    if let Some(limits) = &spec.limits {
        if let Some(cpu) = limits.cpu {
            args.push("--cpus".to_string());
            args.push(cpu.to_string());
        }
        if let Some(memory) = &limits.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// Parses the output of `docker port`, e.g. `80/tcp -> 0.0.0.0:32768`. Ports that are published on
/// several addresses are reported once.
fn parse_port_output(output: &str) -> PortMap {
    let mut map = PortMap::new();
    for line in output.lines() {
        let Some((container, host)) = line.split_once("->") else {
            continue;
        };
        let container_port = container
            .trim()
            .split('/')
            .next()
            .and_then(|port| port.parse::<u16>().ok());
        let host_port = host
            .trim()
            .rsplit(':')
            .next()
            .and_then(|port| port.parse::<u16>().ok());
        if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
            map.entry(container_port).or_insert(host_port);
        }
    }
    map
}
