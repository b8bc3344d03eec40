// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use crate::server::args::OpenMetricsConfig;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use color_eyre::eyre;
use color_eyre::eyre::Context;
use forsvar_common::runtime::AppRuntime;
use std::net::SocketAddr;
use std::ops::Deref;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub(crate) async fn run_metrics_server(
    runtime: AppRuntime,
    args: OpenMetricsConfig,
) -> eyre::Result<()> {
    let cancellation_token = runtime.cancellation_token.clone();
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(runtime);

    let addr: SocketAddr = args
        .openmetrics_listen
        .parse()
        .context("unable to parse the listening address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("unable to start the openmetrics server, is the port taken?")?;

    info!("openmetrics listening on {addr:?}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancellation_token.cancelled().await;
        })
        .await
        .context("openmetrics server error")?;

    Ok(())
}

async fn metrics_handler(State(runtime): State<AppRuntime>) -> Response {
    let mut buffer = String::new();
    if let Err(error) = prometheus_client::encoding::text::encode(
        &mut buffer,
        runtime.metrics_registry.read().await.deref(),
    ) {
        warn! {
            ?error,
            "unable to encode metrics"
        }
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}
