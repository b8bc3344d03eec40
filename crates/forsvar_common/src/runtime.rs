// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::config::AppConfig;
use crate::store::Store;
use futures::future::select_all;
use futures::FutureExt;
use std::sync::Arc;
use tokio::signal::unix::SignalKind;
use tokio::sync::RwLock;
use tokio::{signal, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Common state for components
#[derive(Clone)]
pub struct AppRuntime {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub metrics_registry: Arc<RwLock<prometheus_client::registry::Registry>>,
    pub cancellation_token: CancellationToken,
}

impl AppRuntime {
    pub fn new(config: AppConfig, store: Arc<dyn Store>, cancellation_token: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            store,
            metrics_registry: Default::default(),
            cancellation_token,
        }
    }
}

pub fn create_shutdown_cancellation_token() -> CancellationToken {
    let cancellation_token = CancellationToken::new();
    let signal_cancellation_token = cancellation_token.clone();

    spawn(async move {
        let mut signals: Vec<signal::unix::Signal> = [
            signal::unix::signal(SignalKind::terminate()),
            signal::unix::signal(SignalKind::interrupt()),
        ]
        .into_iter()
        .filter_map(|maybe_signal| match maybe_signal {
            Ok(signal) => Some(signal),
            Err(error) => {
                error! {
                    ?error,
                    "unable to listen for shutdown signal"
                }
                None
            }
        })
        .collect();
        if signals.is_empty() {
            return;
        }

        let signal_futures = signals.iter_mut().map(|signal| signal.recv().boxed());
        select_all(signal_futures).await;

        info!("shutdown signal received");
        signal_cancellation_token.cancel();
    });
    cancellation_token
}
