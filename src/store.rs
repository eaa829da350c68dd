/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/store.rs
*
* This file defines the seam between the reconciliation engine and the
* Kubernetes API server. The engine never talks to `kube::Api` directly;
* it goes through the `ResourceStore` trait so that tests can substitute an
* in-memory store or a `mockall` double.
*
* Architecture:
* - `ChildResource` wraps the five typed objects that make up one preview
*   environment. `ResourceKind` names them without carrying a body.
* - `StoreError` is the small failure taxonomy every store call reports:
*   `NotFound`, `AlreadyExists`, `Conflict`, `Transient` and `Fatal`.
* - `KubeStore` is the production implementation, one API round trip per call.
*   Creates go through the typed API of each object. Patch, delete and get
*   only need the kind's coordinates, so they share one `DynamicObject` path.
*   Raw status codes from the API server are translated into `StoreError`
*   here and nowhere else.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::PreviewEnvironment;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    Client, Error as KubeError, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Failure taxonomy reported by every store operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transient(_))
    }
}

impl From<KubeError> for StoreError {
    fn from(err: KubeError) -> Self {
        match err {
            KubeError::Api(ae) => match ae.code {
                404 => StoreError::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(ae.message),
                409 => StoreError::Conflict(ae.message),
                429 | 500..=599 => StoreError::Transient(ae.message),
                _ => StoreError::Fatal(format!("{} ({})", ae.message, ae.code)),
            },
            // Connection resets, timeouts and the like never reached the API server.
            other => StoreError::Transient(other.to_string()),
        }
    }
}

/// The kinds of child resource a preview environment is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Workload,
    Endpoint,
    Route,
    IsolationPolicy,
}

impl ResourceKind {
    /// Label value used for `preview_environments_failed_total{step}`.
    pub fn step(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::Workload => "deployment",
            ResourceKind::Endpoint => "service",
            ResourceKind::Route => "ingress",
            ResourceKind::IsolationPolicy => "network_policy",
        }
    }

    /// API group, version and plural of the kind.
    pub fn api_resource(self) -> ApiResource {
        match self {
            ResourceKind::Namespace => ApiResource::erase::<Namespace>(&()),
            ResourceKind::Workload => ApiResource::erase::<Deployment>(&()),
            ResourceKind::Endpoint => ApiResource::erase::<Service>(&()),
            ResourceKind::Route => ApiResource::erase::<Ingress>(&()),
            ResourceKind::IsolationPolicy => ApiResource::erase::<NetworkPolicy>(&()),
        }
    }

    pub fn is_namespaced(self) -> bool {
        self != ResourceKind::Namespace
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Workload => "Deployment",
            ResourceKind::Endpoint => "Service",
            ResourceKind::Route => "Ingress",
            ResourceKind::IsolationPolicy => "NetworkPolicy",
        };
        f.write_str(kind)
    }
}

/// A fully built child resource, ready to be sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildResource {
    Namespace(Namespace),
    Workload(Deployment),
    Endpoint(Service),
    Route(Ingress),
    IsolationPolicy(NetworkPolicy),
}

impl ChildResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ChildResource::Namespace(_) => ResourceKind::Namespace,
            ChildResource::Workload(_) => ResourceKind::Workload,
            ChildResource::Endpoint(_) => ResourceKind::Endpoint,
            ChildResource::Route(_) => ResourceKind::Route,
            ChildResource::IsolationPolicy(_) => ResourceKind::IsolationPolicy,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ChildResource::Namespace(o) => o.name_any(),
            ChildResource::Workload(o) => o.name_any(),
            ChildResource::Endpoint(o) => o.name_any(),
            ChildResource::Route(o) => o.name_any(),
            ChildResource::IsolationPolicy(o) => o.name_any(),
        }
    }

    /// The namespace the object lives in. `None` for the cluster-scoped Namespace itself.
    pub fn namespace(&self) -> Option<String> {
        match self {
            ChildResource::Namespace(_) => None,
            ChildResource::Workload(o) => o.namespace(),
            ChildResource::Endpoint(o) => o.namespace(),
            ChildResource::Route(o) => o.namespace(),
            ChildResource::IsolationPolicy(o) => o.namespace(),
        }
    }
}

/// Raw access to the external resource store.
///
/// Implementations report failures verbatim; idempotency rules live in
/// [`crate::applier::ResourceApplier`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create the object. Reports `AlreadyExists` if it is already present.
    async fn create(&self, resource: &ChildResource) -> Result<(), StoreError>;

    /// Strategic-merge patch an existing object.
    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Delete the object. Reports `NotFound` if it is absent.
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str)
        -> Result<(), StoreError>;

    /// Read the object, reporting `NotFound` if it is absent.
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Delete the `PreviewEnvironment` record that declares an environment.
    async fn remove_record(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// `ResourceStore` backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    /// Untyped API handle for `kind`, scoped to `namespace` when the kind is namespaced.
    fn dynamic(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        if kind.is_namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        }
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String, StoreError> {
    obj.meta().namespace.clone().ok_or_else(|| {
        StoreError::Fatal(format!(
            "object '{}' has no namespace",
            obj.meta().name.as_deref().unwrap_or("<unnamed>")
        ))
    })
}

async fn create_with<K>(api: Api<K>, obj: &K) -> Result<(), StoreError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + fmt::Debug,
{
    api.create(&PostParams::default(), obj).await?;
    Ok(())
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn create(&self, resource: &ChildResource) -> Result<(), StoreError> {
        debug!(kind = %resource.kind(), name = %resource.name(), "POST");
        match resource {
            ChildResource::Namespace(ns) => create_with(self.namespaces(), ns).await,
            ChildResource::Workload(o) => create_with(self.namespaced(&namespace_of(o)?), o).await,
            ChildResource::Endpoint(o) => create_with(self.namespaced(&namespace_of(o)?), o).await,
            ChildResource::Route(o) => create_with(self.namespaced(&namespace_of(o)?), o).await,
            ChildResource::IsolationPolicy(o) => {
                create_with(self.namespaced(&namespace_of(o)?), o).await
            }
        }
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        debug!(%kind, namespace, name, "PATCH");
        self.dynamic(kind, namespace)
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        debug!(%kind, namespace, name, "DELETE");
        self.dynamic(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.dynamic(kind, namespace).get(name).await?;
        Ok(())
    }

    async fn remove_record(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        debug!(namespace, name, "DELETE PreviewEnvironment");
        self.namespaced::<PreviewEnvironment>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
