/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: tests/engine_scenarios.rs
*
* End-to-end lifecycle scenarios for the reconciliation engine, run against
* an in-memory resource store that behaves like the API server for the calls
* the engine makes: creates are rejected when the object exists, patches
* need an existing target, and deleting a namespace removes everything in it.
*
* SPDX-License-Identifier: Apache-2.0
*/

use async_trait::async_trait;
use chrono::{Duration, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use preview_operator::{
    ChildResource, EngineSettings, EnvironmentRecord, LifecycleHandler, PreviewEnvironmentSpec,
    PreviewMetrics, ReconciliationEngine, ResourceApplier, ResourceKind, ResourceStore,
    StoreError, SweepOutcome,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

type Key = (ResourceKind, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, ChildResource>,
    records: BTreeSet<(String, String)>,
    failing: Option<(ResourceKind, StoreError)>,
    mutations: usize,
}

#[derive(Default)]
struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    fn key(kind: ResourceKind, namespace: &str, name: &str) -> Key {
        let namespace = if kind == ResourceKind::Namespace { "" } else { namespace };
        (kind, namespace.to_string(), name.to_string())
    }

    fn fail(&self, kind: ResourceKind, err: StoreError) {
        self.state.lock().unwrap().failing = Some((kind, err));
    }

    fn heal(&self) {
        self.state.lock().unwrap().failing = None;
    }

    fn get_object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<ChildResource> {
        let state = self.state.lock().unwrap();
        state.objects.get(&Self::key(kind, namespace, name)).cloned()
    }

    fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    fn add_record(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.records.insert((namespace.to_string(), name.to_string()));
    }

    fn has_record(&self, namespace: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.records.contains(&(namespace.to_string(), name.to_string()))
    }

    fn check_failure(state: &State, kind: ResourceKind) -> Result<(), StoreError> {
        match &state.failing {
            Some((failing_kind, err)) if *failing_kind == kind => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn create(&self, resource: &ChildResource) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, resource.kind())?;

        let namespace = resource.namespace().unwrap_or_default();
        let key = Self::key(resource.kind(), &namespace, &resource.name());
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(resource.name()));
        }
        state.objects.insert(key, resource.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, kind)?;

        let key = Self::key(kind, namespace, name);
        let Some(ChildResource::Workload(deployment)) = state.objects.get_mut(&key) else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        let image = patch["spec"]["template"]["spec"]["containers"][0]["image"]
            .as_str()
            .map(str::to_string);
        let pod_spec = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .ok_or_else(|| StoreError::Fatal("deployment without pod spec".into()))?;
        pod_spec.containers[0].image = image;
        state.mutations += 1;
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, kind)?;

        let key = Self::key(kind, namespace, name);
        if state.objects.remove(&key).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if kind == ResourceKind::Namespace {
            state.objects.retain(|(_, ns, _), _| ns != name);
        }
        state.mutations += 1;
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, kind)?;

        if state.objects.contains_key(&Self::key(kind, namespace, name)) {
            Ok(())
        } else {
            Err(StoreError::NotFound(name.to_string()))
        }
    }

    async fn remove_record(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .records
            .remove(&(namespace.to_string(), name.to_string()))
        {
            state.mutations += 1;
            Ok(())
        } else {
            Err(StoreError::NotFound(name.to_string()))
        }
    }
}

fn engine_with(store: Arc<FakeStore>) -> ReconciliationEngine {
    ReconciliationEngine::new(
        ResourceApplier::new(store),
        Arc::new(PreviewMetrics::new().unwrap()),
        EngineSettings {
            base_domain: "orima.com".to_string(),
            cluster_issuer: "letsencrypt-prod".to_string(),
            ingress_namespace: "ingress-nginx".to_string(),
        },
    )
}

fn spec(pr_number: u64, tag: &str) -> PreviewEnvironmentSpec {
    PreviewEnvironmentSpec {
        pr_number,
        branch_name: Some("feature-x".to_string()),
        image: Some("org/app".to_string()),
        image_tag: Some(tag.to_string()),
        ttl_seconds: None,
    }
}

fn workload_image(store: &FakeStore, pr: u64) -> Option<String> {
    let namespace = format!("preview-pr-{pr}");
    let name = format!("pr-{pr}-app");
    match store.get_object(ResourceKind::Workload, &namespace, &name)? {
        ChildResource::Workload(Deployment { spec, .. }) => {
            spec?.template.spec?.containers.first()?.image.clone()
        }
        _ => None,
    }
}

#[tokio::test]
async fn test_create_then_update_pr_142() {
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(store.clone());

    let created = engine.on_create(&spec(142, "v2.1")).await.unwrap();
    assert_eq!(created.namespace, "preview-pr-142");
    assert_eq!(created.workload_name, "pr-142-app");
    assert_eq!(created.url, "https://pr-142.preview.orima.com");
    assert_eq!(store.object_count(), 5);
    assert_eq!(workload_image(&store, 142).as_deref(), Some("org/app:v2.1"));

    let metrics = engine.metrics();
    assert_eq!(metrics.created_total.with_label_values(&["feature-x"]).get(), 1);
    assert_eq!(metrics.active.get(), 1);

    let service_before = store.get_object(ResourceKind::Endpoint, "preview-pr-142", "pr-142-svc");
    let ingress_before =
        store.get_object(ResourceKind::Route, "preview-pr-142", "pr-142-ingress");
    let reconciles_before = metrics.reconcile_total.with_label_values(&["142"]).get();

    let updated = engine.on_update(&spec(142, "v2.2")).await.unwrap();
    assert_eq!(updated.image, "org/app:v2.2");
    assert_eq!(workload_image(&store, 142).as_deref(), Some("org/app:v2.2"));
    assert_eq!(
        store.get_object(ResourceKind::Endpoint, "preview-pr-142", "pr-142-svc"),
        service_before
    );
    assert_eq!(
        store.get_object(ResourceKind::Route, "preview-pr-142", "pr-142-ingress"),
        ingress_before
    );
    assert_eq!(
        metrics.reconcile_total.with_label_values(&["142"]).get(),
        reconciles_before + 1
    );
    assert_eq!(metrics.active.get(), 1);
}

#[tokio::test]
async fn test_partial_create_converges_on_retry() {
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(store.clone());

    store.fail(ResourceKind::Route, StoreError::Transient("apiserver timeout".into()));
    let err = engine.on_create(&spec(7, "v1")).await.unwrap_err();
    assert!(err.is_retryable());
    // Namespace, Deployment and Service survive the failed attempt.
    assert_eq!(store.object_count(), 3);
    assert_eq!(engine.metrics().failed_total.with_label_values(&["ingress"]).get(), 1);
    assert_eq!(engine.metrics().active.get(), 0);

    store.heal();
    let outcome = engine.on_create(&spec(7, "v1")).await.unwrap();
    assert_eq!(outcome.route_name, "pr-7-ingress");
    assert_eq!(store.object_count(), 5);
    assert_eq!(engine.metrics().active.get(), 1);
    assert_eq!(engine.metrics().created_total.with_label_values(&["feature-x"]).get(), 1);
}

#[tokio::test]
async fn test_invalid_spec_never_touches_the_store() {
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(store.clone());

    let mut missing_image = spec(9, "v1");
    missing_image.image = None;
    assert!(engine.on_create(&missing_image).await.unwrap_err().is_permanent());
    assert!(engine.on_update(&missing_image).await.unwrap_err().is_permanent());

    assert_eq!(store.mutations(), 0);
}

#[tokio::test]
async fn test_update_before_create_is_not_found() {
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(store.clone());

    let err = engine.on_update(&spec(11, "v2")).await.unwrap_err();
    assert!(!err.is_permanent());
    assert!(matches!(
        err,
        preview_operator::EngineError::Store {
            source: StoreError::NotFound(_),
            ..
        }
    ));
    assert_eq!(store.object_count(), 0);
}

#[tokio::test]
async fn test_delete_cascades_and_is_idempotent() {
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(store.clone());

    engine.on_create(&spec(142, "v2.1")).await.unwrap();
    engine.on_create(&spec(143, "v1")).await.unwrap();
    assert_eq!(store.object_count(), 10);
    assert_eq!(engine.metrics().active.get(), 2);

    engine.on_delete(&spec(142, "v2.1")).await.unwrap();
    assert_eq!(store.object_count(), 5);
    assert_eq!(engine.metrics().active.get(), 1);

    engine.on_delete(&spec(142, "v2.1")).await.unwrap();
    assert_eq!(store.object_count(), 5);
    assert_eq!(engine.metrics().active.get(), 0);
}

#[tokio::test]
async fn test_resume_rebuilds_active_gauge_after_restart() {
    let store = Arc::new(FakeStore::default());
    let before_restart = engine_with(store.clone());
    before_restart.on_create(&spec(1, "v1")).await.unwrap();
    before_restart.on_create(&spec(2, "v1")).await.unwrap();
    before_restart.on_delete(&spec(2, "v1")).await.unwrap();

    // Fresh metrics, same cluster.
    let after_restart = engine_with(store.clone());
    assert!(after_restart.on_resume(&spec(1, "v1")).await.unwrap());
    assert!(!after_restart.on_resume(&spec(2, "v1")).await.unwrap());
    assert_eq!(after_restart.metrics().active.get(), 1);

    store.fail(ResourceKind::Namespace, StoreError::Fatal("forbidden".into()));
    assert!(after_restart.on_resume(&spec(1, "v1")).await.is_err());
    assert_eq!(after_restart.metrics().active.get(), 1);
}

#[tokio::test]
async fn test_expiry_removes_only_the_record() {
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(store.clone());
    let now = Utc::now();

    let mut expiring = spec(142, "v2.1");
    expiring.ttl_seconds = Some(3600);
    engine.on_create(&expiring).await.unwrap();
    store.add_record("previews", "pr-142");

    let record = EnvironmentRecord {
        name: "pr-142".to_string(),
        namespace: "previews".to_string(),
        creation_timestamp: now - Duration::hours(2),
    };
    let outcome = engine.on_tick(&record, &expiring, now).await.unwrap();

    assert_eq!(outcome, SweepOutcome::Expired);
    assert!(!store.has_record("previews", "pr-142"));
    // Children and the gauge are left to the delete transition.
    assert_eq!(store.object_count(), 5);
    assert_eq!(engine.metrics().active.get(), 1);
    assert_eq!(engine.metrics().expired_total.get(), 1);

    // The record's deletion then arrives as an ordinary delete.
    engine.on_delete(&expiring).await.unwrap();
    assert_eq!(store.object_count(), 0);
    assert_eq!(engine.metrics().active.get(), 0);
}

#[tokio::test]
async fn test_records_without_ttl_are_never_removed() {
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(store.clone());
    let now = Utc::now();
    store.add_record("previews", "pr-5");

    let record = EnvironmentRecord {
        name: "pr-5".to_string(),
        namespace: "previews".to_string(),
        creation_timestamp: now - Duration::days(400),
    };
    for _ in 0..3 {
        let outcome = engine.on_tick(&record, &spec(5, "v1"), now).await.unwrap();
        assert_eq!(outcome, SweepOutcome::Retained);
    }

    assert!(store.has_record("previews", "pr-5"));
    assert_eq!(engine.metrics().expired_total.get(), 0);
}

#[tokio::test]
async fn test_concurrent_environments_share_metrics() {
    let store = Arc::new(FakeStore::default());
    let engine = Arc::new(engine_with(store.clone()));

    let tasks: Vec<_> = (100..120)
        .map(|pr| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.on_create(&spec(pr, "v1")).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(engine.metrics().active.get(), 20);
    assert_eq!(engine.metrics().created_total.with_label_values(&["feature-x"]).get(), 20);
    assert_eq!(store.object_count(), 100);
}
