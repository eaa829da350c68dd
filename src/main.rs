/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* Archive: src/main.rs
*
* This file is the main entry point for the preview operator. It is
* responsible for setting up and running everything the reconciliation
* engine needs around it.
*
* Architecture:
* 1.  **Initialization**: parse the command line, set up `tracing` for
*     structured JSON logging and create the Kubernetes client.
* 2.  **Metrics**: build the `PreviewMetrics` registry. The same instance is
*     injected into the engine and served on `/metrics`.
* 3.  **Resume**: before any event is processed, every environment that was
*     active before the restart is probed so the active gauge starts from the
*     live cluster state instead of zero.
* 4.  **Concurrent Execution**: the metrics server, the kube-runtime
*     controller and the TTL sweeper run side by side under `tokio::join!`.
*
* SPDX-License-Identifier: Apache-2.0 */

use anyhow::Context as _;
use clap::Parser;
use futures::stream::StreamExt;
use kube::{Api, Client, CustomResourceExt};
use kube_runtime::{watcher, Controller};
use preview_operator::config::{Cli, Commands, RunArgs};
use preview_operator::controllers::preview_controller::{self, Context};
use preview_operator::{
    KubeStore, LifecycleHandler, PreviewEnvironment, PreviewMetrics, ReconciliationEngine,
    ResourceApplier,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::http::StatusCode;
use warp::Filter;

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(
    metrics: Arc<PreviewMetrics>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let (body, status) = match metrics.encode() {
        Ok(body) => (body, StatusCode::OK),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    Ok(warp::reply::with_status(
        warp::reply::with_header(body, "Content-Type", prometheus::TEXT_FORMAT),
        status,
    ))
}

/// Runs the HTTP server to expose the /metrics endpoint.
async fn run_metrics_server(metrics: Arc<PreviewMetrics>, port: u16) {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&metrics)))
        .and_then(metrics_handler);

    info!(port, "starting metrics server");
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing()?;

    let client = Client::try_default()
        .await
        .context("failed to initialize Kubernetes client")?;

    let records: Api<PreviewEnvironment> = match &args.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let metrics = Arc::new(PreviewMetrics::new().context("failed to register metrics")?);
    let applier = ResourceApplier::new(Arc::new(KubeStore::new(client.clone())));
    let handler: Arc<dyn LifecycleHandler> = Arc::new(ReconciliationEngine::new(
        applier,
        metrics.clone(),
        args.engine_settings(),
    ));

    preview_controller::resume_all(&records, handler.as_ref())
        .await
        .context("failed to resume preview environments")?;

    let context = Arc::new(Context {
        client: client.clone(),
        handler: handler.clone(),
    });

    info!(base_domain = %args.base_domain, "preview operator starting");

    tokio::join!(
        run_metrics_server(metrics.clone(), args.metrics_port),
        preview_controller::run_sweeper(records.clone(), handler.clone(), args.sweep_interval()),
        Controller::new(records, watcher::Config::default())
            .run(
                preview_controller::reconcile,
                preview_controller::on_error,
                context,
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled PreviewEnvironment: {:?}", o),
                    Err(e) => error!("PreviewEnvironment reconcile error: {}", e),
                }
            })
    );

    info!("preview operator shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.into_command() {
        Commands::Run(args) => run(args).await,
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&PreviewEnvironment::crd())?);
            Ok(())
        }
    }
}
