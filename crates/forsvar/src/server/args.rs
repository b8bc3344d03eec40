// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use clap::ArgAction;
use clap_derive::{Args, Parser};

/// Instance provisioning and round judging for attack/defense CTFs
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Args {
    /// The path to the configuration file
    #[arg(env, long, default_value = "forsvar.toml", value_name = "CONFIG_FILE")]
    pub config_file: String,

    #[command(flatten, next_help_heading = "Component selection options")]
    pub components: Components,

    #[command(flatten, next_help_heading = "OpenMetrics configuration options")]
    pub openmetrics: OpenMetricsConfig,
}

/// Components
#[derive(Args, Debug)]
#[group()]
pub(crate) struct Components {
    /// Enable the competition watcher and the lifecycle hooks
    #[arg(env, long, action = ArgAction::Set, default_value_t = true)]
    pub enable_controller: bool,

    /// Enable the sweep of expired instances
    #[arg(env, long, action = ArgAction::Set, default_value_t = true)]
    pub enable_sweeper: bool,

    /// Enable the OpenMetrics endpoint
    #[arg(env, long, action = ArgAction::Set, default_value_t = true)]
    pub enable_openmetrics: bool,
}

#[derive(Args, Debug)]
pub(crate) struct OpenMetricsConfig {
    /// The address the OpenMetrics endpoint listens on
    #[arg(env, long, default_value = "127.0.0.1:9090")]
    pub openmetrics_listen: String,
}
