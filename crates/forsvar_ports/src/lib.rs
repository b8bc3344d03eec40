// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

//! Hands out host ports for instances.
//!
//! A port is in use if it is published by a running instance, if it belongs to a port block that
//! was reserved for a team, or if the operating system reports it as bound. Reservations are only
//! recorded once a container has started, so the live probe covers the window in between as well
//! as ports held by unrelated processes.

mod probe;

pub use probe::{PortProbe, TcpProbe};

use forsvar_common::config::PortsConfig;
use forsvar_common::models::ports::{parse_port_block, parse_port_map};
use forsvar_common::store::{InstanceFilter, Store, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum PortError {
    #[error("no free port left in the range")]
    PortExhausted,
    #[error("insufficient ports: requested {requested}, only {available} available")]
    InsufficientPorts { requested: usize, available: usize },
    #[error("unable to read port reservations")]
    Store(#[from] StoreError),
}

pub struct PortAllocator {
    store: Arc<dyn Store>,
    range: PortsConfig,
    probe: Arc<dyn PortProbe>,
    // Serializes allocation calls within this process
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn Store>, range: PortsConfig, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            store,
            range,
            probe,
            lock: Mutex::new(()),
        }
    }

    pub fn range(&self) -> PortsConfig {
        self.range
    }

    /// Returns the lowest free port in the range.
    pub async fn allocate_one(&self) -> Result<u16, PortError> {
        let _guard = self.lock.lock().await;
        let reserved = self.reserved_ports().await?;

        for port in self.range.start..=self.range.end {
            if reserved.contains(&port) {
                continue;
            }
            if self.probe.is_free(port).await {
                debug!("allocated port {port}");
                return Ok(port);
            }
        }
        Err(PortError::PortExhausted)
    }

    /// Returns `count` distinct free ports, scanning the range once.
    pub async fn allocate_batch(&self, count: usize) -> Result<Vec<u16>, PortError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.lock.lock().await;
        let reserved = self.reserved_ports().await?;

        let mut selected = Vec::with_capacity(count);
        // Ports handed out by this call aren't persisted yet
        let mut taken = HashSet::with_capacity(count);
        for port in self.range.start..=self.range.end {
            if selected.len() == count {
                break;
            }
            if reserved.contains(&port) || taken.contains(&port) {
                continue;
            }
            if !self.probe.is_free(port).await {
                continue;
            }
            taken.insert(port);
            selected.push(port);
        }

        if selected.len() < count {
            return Err(PortError::InsufficientPorts {
                requested: count,
                available: selected.len(),
            });
        }
        debug!("allocated a batch of {count} ports: {selected:?}");
        Ok(selected)
    }

    /// Collects every port that is claimed by a running instance or a reserved team block.
    async fn reserved_ports(&self) -> Result<HashSet<u16>, PortError> {
        let mut reserved = HashSet::new();

        let instances = self.store.instances(&InstanceFilter::running()).await?;
        for instance in &instances {
            reserved.extend(parse_port_map(&instance.ports).into_values());
        }

        for block in self.store.team_port_blocks().await? {
            reserved.extend(parse_port_block(&block));
        }
        Ok(reserved)
    }
}
