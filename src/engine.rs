/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/engine.rs
*
* This file implements the reconciliation engine for preview environments.
* It turns a declared `PreviewEnvironmentSpec` into operations on the child
* resources of the environment and keeps the operational metrics in step with
* what it did.
*
* Architecture:
* The engine is driven from outside through the `LifecycleHandler` trait,
* one method per transition. It does not watch anything itself, holds no
* locks and keeps no state between calls: names are re-derived from the PR
* number every time and the resource store is the only source of truth.
*
* Transitions:
* - **Create** (`Absent -> Active`): validate, then create Namespace,
*   Deployment, Service, Ingress and NetworkPolicy in that order. A failing
*   step is counted under its own label and reported; nothing already created
*   is rolled back because re-running the create converges (every create is
*   idempotent).
* - **Update** (`Active -> Active`): patch the workload container image. No
*   other child resource is touched.
* - **Delete** (`Active -> Absent`): delete the namespace and let the API
*   server garbage-collect everything inside it. The active gauge drops once
*   per accepted delete, whether or not the namespace was still there.
* - **Resume**: after a restart, count an environment as active again if its
*   namespace still exists.
* - **Tick**: remove the `PreviewEnvironment` record once its TTL has elapsed.
*   The removal comes back through the delete transition, which is where the
*   gauge and the namespace are handled.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::applier::ResourceApplier;
use crate::builders::{
    build_endpoint, build_isolation_policy, build_namespace, build_route, build_workload,
    CONTAINER_NAME,
};
use crate::crds::PreviewEnvironmentSpec;
use crate::metrics::{PreviewMetrics, UPDATE_STEP};
use crate::names::{self, DerivedNames};
use crate::store::{ChildResource, ResourceKind, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub const STATUS_CREATED: &str = "Environment Created";
pub const STATUS_UPDATED: &str = "Environment Updated";

/// Failure step label used when removing an expired record fails.
const EXPIRE_STEP: &str = "expire";

#[derive(Debug, Error)]
pub enum EngineError {
    /// The record can never succeed as declared; retrying is pointless.
    #[error("invalid PreviewEnvironment spec: {0}")]
    Validation(String),

    #[error("{step} step failed: {source}")]
    Store {
        step: &'static str,
        #[source]
        source: StoreError,
    },
}

impl EngineError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }

    /// Whether the underlying store failure is worth a quick retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Validation(_) => false,
            EngineError::Store { source, .. } => source.is_retryable(),
        }
    }
}

/// Cluster-wide settings that shape the child resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub base_domain: String,
    pub cluster_issuer: String,
    pub ingress_namespace: String,
}

/// Result of a successful create or update, reported back on the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentOutcome {
    pub status: String,
    pub namespace: String,
    pub workload_name: String,
    pub endpoint_name: String,
    pub route_name: String,
    pub url: String,
    pub image: String,
}

impl EnvironmentOutcome {
    fn new(status: &str, names: &DerivedNames, image: String) -> Self {
        Self {
            status: status.to_string(),
            namespace: names.namespace.clone(),
            workload_name: names.workload_name.clone(),
            endpoint_name: names.endpoint_name.clone(),
            route_name: names.route_name.clone(),
            url: names.url(),
            image,
        }
    }
}

/// Identity of a `PreviewEnvironment` record, as seen by the expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRecord {
    pub name: String,
    pub namespace: String,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Retained,
    Expired,
}

/// One method per lifecycle transition, invoked by whatever delivers events.
///
/// Callers must not run two transitions for the same PR number concurrently.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    async fn on_create(
        &self,
        spec: &PreviewEnvironmentSpec,
    ) -> Result<EnvironmentOutcome, EngineError>;

    async fn on_update(
        &self,
        spec: &PreviewEnvironmentSpec,
    ) -> Result<EnvironmentOutcome, EngineError>;

    async fn on_delete(&self, spec: &PreviewEnvironmentSpec) -> Result<(), EngineError>;

    /// Returns whether the environment was found active.
    async fn on_resume(&self, spec: &PreviewEnvironmentSpec) -> Result<bool, EngineError>;

    async fn on_tick(
        &self,
        record: &EnvironmentRecord,
        spec: &PreviewEnvironmentSpec,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome, EngineError>;
}

pub struct ReconciliationEngine {
    applier: ResourceApplier,
    metrics: Arc<PreviewMetrics>,
    settings: EngineSettings,
}

fn validate(spec: &PreviewEnvironmentSpec) -> Result<String, EngineError> {
    let missing: Vec<&str> = [("image", &spec.image), ("image_tag", &spec.image_tag)]
        .into_iter()
        .filter(|(_, value)| value.as_deref().map_or(true, str::is_empty))
        .map(|(field, _)| field)
        .collect();

    match spec.image_reference() {
        Some(reference) if missing.is_empty() => Ok(reference),
        _ => Err(EngineError::Validation(format!(
            "missing required field(s): {}",
            missing.join(", ")
        ))),
    }
}

impl ReconciliationEngine {
    pub fn new(
        applier: ResourceApplier,
        metrics: Arc<PreviewMetrics>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            applier,
            metrics,
            settings,
        }
    }

    pub fn metrics(&self) -> &Arc<PreviewMetrics> {
        &self.metrics
    }

    pub fn names_for(&self, spec: &PreviewEnvironmentSpec) -> DerivedNames {
        names::derive(spec.pr_number, &self.settings.base_domain)
    }

    /// The child resources of an environment, in the order they must be applied.
    pub fn desired_resources(&self, names: &DerivedNames, image: &str) -> Vec<ChildResource> {
        vec![
            ChildResource::Namespace(build_namespace(names)),
            ChildResource::Workload(build_workload(names, image)),
            ChildResource::Endpoint(build_endpoint(names)),
            ChildResource::Route(build_route(names, &self.settings.cluster_issuer)),
            ChildResource::IsolationPolicy(build_isolation_policy(
                names,
                &self.settings.ingress_namespace,
            )),
        ]
    }

    /// Provisions every child resource of an environment.
    ///
    /// Resources are applied in order (Namespace, Deployment, Service, Ingress,
    /// NetworkPolicy) and each create tolerates an object that already exists,
    /// so calling this again after a partial failure picks up where it stopped.
    ///
    /// # Arguments
    /// * `spec` - The declared environment. `image` and `image_tag` are required.
    ///
    /// # Returns
    /// The names and URL of the environment, or the first failing step. Created
    /// and active metrics move only when every step succeeded.
    #[instrument(skip_all, fields(pr = spec.pr_number))]
    pub async fn create(
        &self,
        spec: &PreviewEnvironmentSpec,
    ) -> Result<EnvironmentOutcome, EngineError> {
        let image = validate(spec)?;

        let started = Instant::now();
        let names = self.names_for(spec);

        for resource in self.desired_resources(&names, &image) {
            let kind = resource.kind();
            if let Err(source) = self.applier.apply_create(&resource).await {
                let step = kind.step();
                self.metrics.record_failure(step);
                error!(%kind, name = %resource.name(), error = %source, "create step failed");
                return Err(EngineError::Store { step, source });
            }
            debug!(%kind, name = %resource.name(), "applied");
        }

        self.metrics
            .record_created(spec.branch_name.as_deref(), started.elapsed());
        self.metrics.environment_activated();
        self.metrics.record_reconcile(spec.pr_number);

        info!(namespace = %names.namespace, url = %names.url(), "preview environment created");
        Ok(EnvironmentOutcome::new(STATUS_CREATED, &names, image))
    }

    /// Points the workload at the newly declared image. Nothing else is touched.
    ///
    /// # Returns
    /// `NotFound` from the store if the workload does not exist yet.
    #[instrument(skip_all, fields(pr = spec.pr_number))]
    pub async fn update(
        &self,
        spec: &PreviewEnvironmentSpec,
    ) -> Result<EnvironmentOutcome, EngineError> {
        let image = validate(spec)?;
        let names = self.names_for(spec);

        let patch = json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{ "name": CONTAINER_NAME, "image": image }]
                    }
                }
            }
        });

        if let Err(source) = self
            .applier
            .apply_patch(
                ResourceKind::Workload,
                &names.namespace,
                &names.workload_name,
                &patch,
            )
            .await
        {
            self.metrics.record_failure(UPDATE_STEP);
            error!(workload = %names.workload_name, error = %source, "image patch failed");
            return Err(EngineError::Store {
                step: UPDATE_STEP,
                source,
            });
        }

        self.metrics.record_reconcile(spec.pr_number);
        info!(workload = %names.workload_name, %image, "workload image updated");
        Ok(EnvironmentOutcome::new(STATUS_UPDATED, &names, image))
    }

    /// Deletes the environment's namespace; a missing namespace counts as deleted.
    #[instrument(skip_all, fields(pr = spec.pr_number))]
    pub async fn delete(&self, spec: &PreviewEnvironmentSpec) -> Result<(), EngineError> {
        let names = self.names_for(spec);

        // Everything else lives inside the namespace and goes with it.
        self.applier
            .apply_delete(ResourceKind::Namespace, "", &names.namespace)
            .await
            .map_err(|source| EngineError::Store {
                step: ResourceKind::Namespace.step(),
                source,
            })?;

        self.metrics.environment_removed();
        info!(namespace = %names.namespace, "preview environment deleted");
        Ok(())
    }

    /// Counts the environment as active if its namespace still exists.
    ///
    /// # Returns
    /// Whether the namespace was found.
    #[instrument(skip_all, fields(pr = spec.pr_number))]
    pub async fn resume(&self, spec: &PreviewEnvironmentSpec) -> Result<bool, EngineError> {
        let names = self.names_for(spec);

        let present = self
            .applier
            .read_exists(ResourceKind::Namespace, "", &names.namespace)
            .await
            .map_err(|source| EngineError::Store {
                step: ResourceKind::Namespace.step(),
                source,
            })?;

        if present {
            self.metrics.environment_activated();
            info!(namespace = %names.namespace, "resumed active environment");
        } else {
            debug!(namespace = %names.namespace, "namespace absent, nothing to resume");
        }
        Ok(present)
    }

    /// Removes the record once its TTL has elapsed.
    ///
    /// The expired counter moves only after the removal went through (or the
    /// record was already gone), so a failed removal retried on the next tick
    /// is counted once.
    ///
    /// # Arguments
    /// * `record` - Identity and creation time of the record.
    /// * `spec` - The declared environment; no `ttl_seconds` means it never expires.
    /// * `now` - Reference time for the age computation.
    ///
    /// # Returns
    /// `Expired` if the record was removed, `Retained` otherwise.
    #[instrument(skip_all, fields(pr = spec.pr_number, record = %record.name))]
    pub async fn sweep(
        &self,
        record: &EnvironmentRecord,
        spec: &PreviewEnvironmentSpec,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome, EngineError> {
        let Some(ttl_seconds) = spec.ttl_seconds else {
            return Ok(SweepOutcome::Retained);
        };

        let age_seconds = now
            .signed_duration_since(record.creation_timestamp)
            .num_seconds();
        if age_seconds < i64::try_from(ttl_seconds).unwrap_or(i64::MAX) {
            return Ok(SweepOutcome::Retained);
        }

        // Only the record is removed; its deletion drives the delete transition.
        self.applier
            .remove_record(&record.namespace, &record.name)
            .await
            .map_err(|source| {
                warn!(error = %source, "failed to remove expired record");
                EngineError::Store {
                    step: EXPIRE_STEP,
                    source,
                }
            })?;

        self.metrics.record_expired();
        info!(age_seconds, ttl_seconds, "preview environment expired");
        Ok(SweepOutcome::Expired)
    }
}

#[async_trait]
impl LifecycleHandler for ReconciliationEngine {
    async fn on_create(
        &self,
        spec: &PreviewEnvironmentSpec,
    ) -> Result<EnvironmentOutcome, EngineError> {
        self.create(spec).await
    }

    async fn on_update(
        &self,
        spec: &PreviewEnvironmentSpec,
    ) -> Result<EnvironmentOutcome, EngineError> {
        self.update(spec).await
    }

    async fn on_delete(&self, spec: &PreviewEnvironmentSpec) -> Result<(), EngineError> {
        self.delete(spec).await
    }

    async fn on_resume(&self, spec: &PreviewEnvironmentSpec) -> Result<bool, EngineError> {
        self.resume(spec).await
    }

    async fn on_tick(
        &self,
        record: &EnvironmentRecord,
        spec: &PreviewEnvironmentSpec,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome, EngineError> {
        self.sweep(record, spec, now).await
    }
}
