// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

mod cli;

pub use cli::CliRuntime;

use async_trait::async_trait;
use forsvar_common::models::PortMap;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("container runtime command timed out after {0:?}")]
    Timeout(Duration),
    #[error("container runtime command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },
    #[error("unexpected container runtime output: {0}")]
    Parse(String),
}

/// A port published by the container. The runtime picks an ephemeral host port if none is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Limits {
    pub cpu: Option<f64>,
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortBinding>,
    /// `None` runs the container without resource limits
    pub limits: Option<Limits>,
    pub env: BTreeMap<String, String>,
    /// Arguments passed to the image's entrypoint
    pub args: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A local container runtime. Implementations bound every call with a timeout.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a detached container, returning its id.
    async fn run(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// The ports that the container actually published
    async fn published_ports(&self, container_id: &str) -> Result<PortMap, RuntimeError>;

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Removes the container. Removing a container that no longer exists succeeds.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
}
