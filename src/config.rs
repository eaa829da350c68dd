/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* This file defines the command-line interface of the operator binary using
* the `clap` crate. Every option of `run` can also be supplied through an
* environment variable, which is how the operator is configured when it runs
* as a Deployment.
*
* `run` is the default: invoking the binary with no subcommand runs the
* operator with the flags given at the top level (or their env vars).
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::engine::EngineSettings;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Kubernetes operator that manages per-pull-request preview environments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: RunArgs,
}

impl Cli {
    /// The subcommand to execute, falling back to `run` with the top-level flags.
    pub fn into_command(self) -> Commands {
        self.command.unwrap_or(Commands::Run(self.run))
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller, the TTL sweeper and the metrics endpoint.
    Run(RunArgs),

    /// Print the PreviewEnvironment CustomResourceDefinition as YAML.
    Crd,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Domain under which preview hosts are published (`pr-<n>.preview.<domain>`).
    #[arg(long, env = "PREVIEW_BASE_DOMAIN", default_value = "orima.com")]
    pub base_domain: String,

    /// cert-manager ClusterIssuer requested on every preview Ingress.
    #[arg(long, env = "PREVIEW_CLUSTER_ISSUER", default_value = "letsencrypt-prod")]
    pub cluster_issuer: String,

    /// Namespace of the ingress controller allowed through the isolation policy.
    #[arg(long, env = "PREVIEW_INGRESS_NAMESPACE", default_value = "ingress-nginx")]
    pub ingress_namespace: String,

    /// Port of the Prometheus `/metrics` endpoint.
    #[arg(long, env = "METRICS_PORT", default_value_t = 8000)]
    pub metrics_port: u16,

    /// Seconds between two TTL expiry sweeps.
    #[arg(long, env = "PREVIEW_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Only watch PreviewEnvironment records in this namespace.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl RunArgs {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            base_domain: self.base_domain.clone(),
            cluster_issuer: self.cluster_issuer.clone(),
            ingress_namespace: self.ingress_namespace.clone(),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic.
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
