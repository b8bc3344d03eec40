// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use clap::Parser;
use color_eyre::eyre;
use tracing_subscriber::EnvFilter;

mod server;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = server::args::Args::try_parse()?;
    server::main(args).await
}
