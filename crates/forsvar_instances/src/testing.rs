// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

//! An in-process container runtime for tests.

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeError};
use async_trait::async_trait;
use forsvar_common::models::PortMap;
use forsvar_ports::PortProbe;
use std::collections::BTreeMap;
use std::sync::Mutex;

const EPHEMERAL_PORT_START: u16 = 45000;

#[derive(Default)]
struct State {
    next_id: u64,
    live: BTreeMap<String, ContainerSpec>,
    removed: Vec<String>,
    execs: Vec<(String, Vec<String>, BTreeMap<String, String>)>,
    fail_run_for_image: Option<String>,
    fail_remove: bool,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn live(&self) -> BTreeMap<String, ContainerSpec> {
        self.state.lock().unwrap().live.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>, BTreeMap<String, String>)> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn fail_run_for_image(&self, image: &str) {
        self.state.lock().unwrap().fail_run_for_image = Some(image.to_string());
    }

    pub fn fail_remove(&self, fail: bool) {
        self.state.lock().unwrap().fail_remove = fail;
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        if state.fail_run_for_image.as_deref() == Some(spec.image.as_str()) {
            return Err(RuntimeError::CommandFailed {
                status: "exit status: 125".to_string(),
                stderr: "unable to pull image".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.live.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn published_ports(&self, container_id: &str) -> Result<PortMap, RuntimeError> {
        let state = self.state.lock().unwrap();
        let spec = state
            .live
            .get(container_id)
            .ok_or_else(|| RuntimeError::Parse(format!("unknown container {container_id}")))?;
        Ok(spec
            .ports
            .iter()
            .enumerate()
            .map(|(idx, binding)| {
                let host_port = binding
                    .host_port
                    .unwrap_or(EPHEMERAL_PORT_START + idx as u16);
                (binding.container_port, host_port)
            })
            .collect())
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state
            .execs
            .push((container_id.to_string(), command.to_vec(), env.clone()));
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(RuntimeError::Timeout(std::time::Duration::from_secs(60)));
        }
        state.live.remove(container_id);
        state.removed.push(container_id.to_string());
        Ok(())
    }
}

/// Reports every port as free
pub(crate) struct FreeProbe;

#[async_trait]
impl PortProbe for FreeProbe {
    async fn is_free(&self, _port: u16) -> bool {
        true
    }
}
