// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::trace;

/// Checks whether the operating system already holds a port
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a listener on all interfaces and releasing it right away
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_free(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(error) => {
                trace!(port, ?error, "port is bound");
                false
            }
        }
    }
}
