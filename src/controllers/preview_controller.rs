/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: preview_controller.rs
 *
 * This file binds the reconciliation engine to the kube-runtime controller
 * machinery for the `PreviewEnvironment` custom resource.
 *
 * Architecture:
 * The controller follows the standard Kubernetes operator pattern. kube-runtime
 * watches `PreviewEnvironment` objects and calls `reconcile` for each change,
 * never running two reconciles for the same object at once. This file decides
 * which lifecycle transition a change represents and hands it to a
 * `LifecycleHandler`; it contains no resource-building logic of its own.
 *
 * Core Logic:
 * - Finalizer Management: `reconcile` wraps everything in kube-runtime's
 *   `finalizer` helper with the `devops.orima.com/finalizer` finalizer, so a
 *   record cannot disappear before its namespace deletion was accepted.
 * - Transition selection: a record whose status is not `Active` is created;
 *   an `Active` record whose declared image differs from the one recorded in
 *   status is updated; anything else is already in sync.
 * - Status Updates: the result payload of a create or update (namespace,
 *   child resource names, URL, image) is written to `.status`, and failures are
 *   recorded there before the error goes back to the runtime.
 * - Deletion: the namespace deletion is accounted for once per record. After
 *   it succeeds the status moves to `Deleted`, and a cleanup retried because
 *   the finalizer could not be removed skips straight to that removal.
 * - `resume_all`: run once at startup, before the controller starts, to rebuild
 *   the active gauge from every environment that may still hold a namespace.
 * - `run_sweeper`: periodically offers every record to the TTL expiry check.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::crds::{EnvironmentPhase, PreviewEnvironment, PreviewEnvironmentStatus};
use crate::engine::{EngineError, EnvironmentOutcome, EnvironmentRecord, LifecycleHandler, SweepOutcome};
use chrono::{DateTime, Utc};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent},
    },
    Error as KubeError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

// The unique identifier for our controller's finalizer.
pub const PREVIEW_FINALIZER: &str = "devops.orima.com/finalizer";

const RESYNC_INTERVAL: Duration = Duration::from_secs(600);
const RETRY_BACKOFF: Duration = Duration::from_secs(15);
const FAILURE_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] KubeError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to update resource status: {0}")]
    StatusUpdateError(#[source] KubeError),

    #[error("PreviewEnvironment '{0}' has no namespace")]
    MissingNamespace(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<FinalizerError<Error>>),
}

impl Error {
    /// The engine error behind this failure, looking through finalizer wrapping.
    fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Error::Engine(e) => Some(e),
            Error::FinalizerError(inner) => match inner.as_ref() {
                FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => {
                    e.engine_error()
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// The context required by the reconciler.
pub struct Context {
    pub client: kube::Client,
    pub handler: Arc<dyn LifecycleHandler>,
}

/// What a change to a record asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Create,
    Update,
    InSync,
}

/// Picks the transition for a live (not deleting) record.
pub fn select_transition(env: &PreviewEnvironment) -> Transition {
    let status = env.status.as_ref();
    let active = status.and_then(|s| s.phase) == Some(EnvironmentPhase::Active);
    if !active {
        return Transition::Create;
    }

    let recorded = status.and_then(|s| s.image.as_deref());
    match env.spec.image_reference() {
        Some(desired) if recorded == Some(desired.as_str()) => Transition::InSync,
        _ => Transition::Update,
    }
}

/// `creationTimestamp` of a record as a chrono time.
///
/// The inner type of `Time` differs between k8s-openapi releases, so this goes
/// through its RFC 3339 wire form.
pub fn creation_time(env: &PreviewEnvironment) -> Option<DateTime<Utc>> {
    let ts = env.metadata.creation_timestamp.as_ref()?;
    let raw = serde_json::to_value(ts).ok()?;
    DateTime::parse_from_rfc3339(raw.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn phase_of(env: &PreviewEnvironment) -> Option<EnvironmentPhase> {
    env.status.as_ref().and_then(|s| s.phase)
}

/// Whether the delete transition already ran for the current deletion.
pub fn cleanup_done(env: &PreviewEnvironment) -> bool {
    phase_of(env) == Some(EnvironmentPhase::Deleted)
}

/// Whether `env` has to be probed at startup.
///
/// Every record whose namespace cleanup is still pending is a candidate: the
/// ones that reached `Active`, and the ones being deleted whose delete has not
/// released the gauge yet. Records still waiting for their first successful
/// create are counted by that create instead.
pub fn needs_resume(env: &PreviewEnvironment) -> bool {
    match phase_of(env) {
        Some(EnvironmentPhase::Deleted) => false,
        Some(EnvironmentPhase::Active | EnvironmentPhase::Deleting) => true,
        _ => env.metadata.deletion_timestamp.is_some(),
    }
}

/// The record to offer to the TTL check, if `env` is eligible at all.
///
/// # Returns
/// `None` for records already being deleted, records without `ttl_seconds`,
/// and records the API server has not yet given a namespace and creation time.
pub fn expiry_candidate(env: &PreviewEnvironment) -> Option<EnvironmentRecord> {
    if env.metadata.deletion_timestamp.is_some() || env.spec.ttl_seconds.is_none() {
        return None;
    }
    Some(EnvironmentRecord {
        name: env.name_any(),
        namespace: env.namespace()?,
        creation_timestamp: creation_time(env)?,
    })
}

fn outcome_status(outcome: &EnvironmentOutcome) -> PreviewEnvironmentStatus {
    PreviewEnvironmentStatus {
        phase: Some(EnvironmentPhase::Active),
        message: Some(outcome.status.clone()),
        namespace: Some(outcome.namespace.clone()),
        deployment: Some(outcome.workload_name.clone()),
        service: Some(outcome.endpoint_name.clone()),
        ingress: Some(outcome.route_name.clone()),
        url: Some(outcome.url.clone()),
        image: Some(outcome.image.clone()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Merge-patches the status subresource. Fields left `None` keep their value.
async fn update_status(
    api: &Api<PreviewEnvironment>,
    name: &str,
    status: PreviewEnvironmentStatus,
) -> Result<(), Error> {
    let patch = Patch::Merge(serde_json::json!({ "status": status }));
    api.patch_status(name, &PatchParams::default(), &patch)
        .await
        .map_err(Error::StatusUpdateError)?;
    Ok(())
}

/// Main reconciliation function for the PreviewEnvironment resource.
pub async fn reconcile(env: Arc<PreviewEnvironment>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = env.name_any();
    let ns = env
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(name.clone()))?;
    let span = info_span!("reconcile_preview", preview = %name, namespace = %ns, pr = env.spec.pr_number);

    async move {
        let api: Api<PreviewEnvironment> = Api::namespaced(ctx.client.clone(), &ns);

        finalizer(&api, PREVIEW_FINALIZER, env, |event| async {
            match event {
                FinalizerEvent::Apply(env) => apply_environment(env, &api, ctx.clone()).await,
                FinalizerEvent::Cleanup(env) => cleanup_environment(env, &api, ctx.clone()).await,
            }
        })
        .await
        .map_err(|e| Error::FinalizerError(Box::new(e)))
    }
    .instrument(span)
    .await
}

async fn apply_environment(
    env: Arc<PreviewEnvironment>,
    api: &Api<PreviewEnvironment>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = env.name_any();
    let transition = select_transition(&env);
    debug!(?transition, "selected transition");

    let result = match transition {
        Transition::InSync => return Ok(Action::requeue(RESYNC_INTERVAL)),
        Transition::Create => {
            update_status(
                api,
                &name,
                PreviewEnvironmentStatus {
                    phase: Some(EnvironmentPhase::Creating),
                    message: Some("Reconciliation started".to_string()),
                    last_transition_time: Some(Utc::now().to_rfc3339()),
                    ..Default::default()
                },
            )
            .await?;
            ctx.handler.on_create(&env.spec).await
        }
        Transition::Update => ctx.handler.on_update(&env.spec).await,
    };

    match result {
        Ok(outcome) => {
            update_status(api, &name, outcome_status(&outcome)).await?;
            info!(url = %outcome.url, "{}", outcome.status);
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) => {
            // An environment that was already active stays active; only its
            // latest update failed.
            let phase = match transition {
                Transition::Update => EnvironmentPhase::Active,
                _ => EnvironmentPhase::Failed,
            };
            let status = PreviewEnvironmentStatus {
                phase: Some(phase),
                message: Some(e.to_string()),
                last_transition_time: Some(Utc::now().to_rfc3339()),
                ..Default::default()
            };
            if let Err(status_err) = update_status(api, &name, status).await {
                warn!(error = %status_err, "failed to record failure in status");
            }
            Err(e.into())
        }
    }
}

async fn cleanup_environment(
    env: Arc<PreviewEnvironment>,
    api: &Api<PreviewEnvironment>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = env.name_any();
    if cleanup_done(&env) {
        debug!("namespace deletion already accounted for, releasing finalizer");
        return Ok(Action::await_change());
    }

    let status = PreviewEnvironmentStatus {
        phase: Some(EnvironmentPhase::Deleting),
        message: Some("Deleting preview environment namespace".to_string()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        ..Default::default()
    };
    // The record is on its way out; a failed status write must not block cleanup.
    if let Err(e) = update_status(api, &name, status).await {
        warn!(error = %e, "failed to mark environment as deleting");
    }

    ctx.handler.on_delete(&env.spec).await?;

    let status = PreviewEnvironmentStatus {
        phase: Some(EnvironmentPhase::Deleted),
        message: Some("Namespace deletion accepted".to_string()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        ..Default::default()
    };
    if let Err(e) = update_status(api, &name, status).await {
        warn!(error = %e, "failed to mark environment as deleted");
    }

    // No need to requeue after cleanup, as the resource will be deleted.
    Ok(Action::await_change())
}

/// Error policy for the controller.
///
/// Validation failures wait for the record to change; store failures are
/// retried, quickly when the store said the failure is transient.
pub fn on_error(env: Arc<PreviewEnvironment>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(preview = %env.name_any(), %error, "reconciliation failed");

    match error.engine_error() {
        Some(e) if e.is_permanent() => Action::await_change(),
        Some(e) if !e.is_retryable() => Action::requeue(FAILURE_BACKOFF),
        _ => Action::requeue(RETRY_BACKOFF),
    }
}

/// Rebuilds the active gauge after a restart.
///
/// Records are selected by [`needs_resume`]. Any probe failure other than
/// "not found" aborts startup.
pub async fn resume_all(
    api: &Api<PreviewEnvironment>,
    handler: &dyn LifecycleHandler,
) -> Result<usize, Error> {
    let records = api.list(&ListParams::default()).await?;
    let mut resumed = 0;

    for env in records.items.iter().filter(|env| needs_resume(env)) {
        if handler.on_resume(&env.spec).await? {
            resumed += 1;
        }
    }

    info!(resumed, "resumed active preview environments");
    Ok(resumed)
}

/// Offers every live record to the TTL expiry check once.
pub async fn sweep_once(
    api: &Api<PreviewEnvironment>,
    handler: &dyn LifecycleHandler,
) -> Result<usize, Error> {
    let records = api.list(&ListParams::default()).await?;
    let now = Utc::now();
    let mut expired = 0;

    for env in records {
        let Some(record) = expiry_candidate(&env) else {
            continue;
        };
        match handler.on_tick(&record, &env.spec, now).await {
            Ok(SweepOutcome::Expired) => expired += 1,
            Ok(SweepOutcome::Retained) => {}
            Err(e) => warn!(preview = %record.name, error = %e, "expiry check failed"),
        }
    }

    Ok(expired)
}

/// Runs the TTL sweep forever on a fixed interval.
pub async fn run_sweeper(
    api: Api<PreviewEnvironment>,
    handler: Arc<dyn LifecycleHandler>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(interval_secs = interval.as_secs(), "starting TTL sweeper");
    loop {
        ticker.tick().await;
        match sweep_once(&api, handler.as_ref()).await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "TTL sweep removed expired previews"),
            Err(e) => warn!(error = %e, "TTL sweep failed"),
        }
    }
}
