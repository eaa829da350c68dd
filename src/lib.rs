/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/lib.rs
*
* Library root of the preview operator. The binary in `main.rs` only wires
* these modules together; everything here can be driven from tests without a
* cluster by plugging an in-memory `ResourceStore` into the engine.
*
* Modules, leaves first:
* - `names`: deterministic child resource names derived from the PR number.
* - `builders`: pure constructors for Namespace, Deployment, Service, Ingress
*   and NetworkPolicy.
* - `store`: the `ResourceStore` trait, its error taxonomy and the kube-rs
*   implementation.
* - `applier`: idempotent create/patch/delete/exists on top of a store.
* - `metrics`: the Prometheus registry injected into the engine.
* - `engine`: the reconciliation engine and its `LifecycleHandler` trait.
* - `controllers`: the kube-runtime controller, resume pass and TTL sweeper.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod applier;
pub mod builders;
pub mod config;
pub mod crds;
pub mod engine;
pub mod metrics;
pub mod names;
pub mod store;

pub mod controllers {
    pub mod preview_controller;
}

pub use applier::ResourceApplier;
pub use crds::{PreviewEnvironment, PreviewEnvironmentSpec, PreviewEnvironmentStatus};
pub use engine::{
    EngineError, EngineSettings, EnvironmentOutcome, EnvironmentRecord, LifecycleHandler,
    ReconciliationEngine, SweepOutcome,
};
pub use metrics::PreviewMetrics;
pub use store::{ChildResource, KubeStore, ResourceKind, ResourceStore, StoreError};
