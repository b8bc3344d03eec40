// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use color_eyre::eyre;
use color_eyre::eyre::Context;
use forsvar_common::config::AppConfig;
use forsvar_common::models::ScoreChanged;
use forsvar_common::runtime::{create_shutdown_cancellation_token, AppRuntime};
use forsvar_common::store::MemoryStore;
use forsvar_instances::runtime::CliRuntime;
use forsvar_instances::{run_sweeper, InstanceManager};
use forsvar_ports::{PortAllocator, TcpProbe};
use forsvar_scheduler::judge::ScriptJudge;
use forsvar_scheduler::SchedulerRegistry;
use std::ops::DerefMut;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) mod args;
mod metrics;

async fn read_app_config<P: AsRef<Path>>(path: P) -> eyre::Result<AppConfig> {
    let content = tokio::fs::read_to_string(path.as_ref())
        .await
        .with_context(|| format!("unable to read {}", path.as_ref().display()))?;
    parse_app_config(&content)
}

fn parse_app_config(content: &str) -> eyre::Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("unable to parse the config file")?;
    config.validate()?;
    Ok(config)
}

/// Loads the competitions, challenges and teams of the config file into the store
async fn seed_store(store: &MemoryStore, config: &AppConfig) {
    for competition in &config.competitions {
        store.insert_competition(competition.clone()).await;
    }
    for challenge in &config.challenges {
        store.insert_challenge(challenge.clone()).await;
    }
    for membership in &config.teams {
        store.insert_membership(membership.clone()).await;
    }
    info!(
        competitions = config.competitions.len(),
        challenges = config.challenges.len(),
        teams = config.teams.len(),
        "seeded the store"
    );
}

async fn log_score_changes(
    score_rx: flume::Receiver<ScoreChanged>,
    cancellation_token: CancellationToken,
) -> eyre::Result<()> {
    loop {
        let event = tokio::select! {
            _ = cancellation_token.cancelled() => break,
            event = score_rx.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        info!(
            competition_id = event.competition_id,
            round = event.round,
            "scores changed"
        );
    }
    Ok(())
}

pub(crate) async fn main(args: args::Args) -> eyre::Result<()> {
    let app_config = read_app_config(&args.config_file).await?;

    let store = Arc::new(MemoryStore::new());
    seed_store(&store, &app_config).await;

    let cancellation_token = create_shutdown_cancellation_token();
    let runtime = AppRuntime::new(app_config, store.clone(), cancellation_token.clone());
    let config = runtime.config.clone();

    let container_runtime = Arc::new(CliRuntime::new(
        config.instances.runtime.clone(),
        config.instances.command_timeout(),
    ));
    let ports = Arc::new(PortAllocator::new(
        store.clone(),
        config.ports,
        Arc::new(TcpProbe),
    ));
    let instances = Arc::new(InstanceManager::new(
        store.clone(),
        container_runtime,
        ports,
        config.instances.clone(),
    ));

    let (score_tx, score_rx) = flume::unbounded();
    let scheduler = SchedulerRegistry::new(
        store.clone(),
        Arc::new(ScriptJudge::from_config(&config.scheduler)),
        config.scheduler.clone(),
        score_tx,
        cancellation_token.clone(),
    );

    {
        let mut registry = runtime.metrics_registry.write().await;
        instances.metrics().register(registry.deref_mut());
        scheduler.metrics().register(registry.deref_mut());
    }

    info!("starting components");
    let mut set: JoinSet<eyre::Result<()>> = JoinSet::new();
    set.spawn(log_score_changes(score_rx, cancellation_token.clone()));

    if args.components.enable_sweeper {
        let instances = instances.clone();
        let interval = config.instances.sweep_interval();
        let cancellation_token = cancellation_token.clone();
        set.spawn(async move {
            run_sweeper(instances, interval, cancellation_token).await;
            Ok(())
        });
    }
    if args.components.enable_controller {
        set.spawn(forsvar_controller::main(
            runtime.clone(),
            instances.clone(),
            scheduler.clone(),
        ));
    } else {
        warn!("the controller is disabled, competitions will not be provisioned or judged");
    }
    if args.components.enable_openmetrics {
        set.spawn(metrics::run_metrics_server(
            runtime.clone(),
            args.openmetrics,
        ));
    }

    while let Some(res) = set.join_next().await {
        // Propagate error
        res??;
    }

    Ok(())
}
