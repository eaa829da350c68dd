/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/applier.rs
*
* Idempotent apply operations on top of a `ResourceStore`.
*
* - `apply_create` treats `AlreadyExists` as success, so re-running a
*   partially completed create converges instead of failing.
* - `apply_patch` assumes the target exists; `NotFound` is reported.
* - `apply_delete` and `remove_record` treat `NotFound` as success.
* - `read_exists` turns `NotFound` into `false` and propagates anything else.
*
* Each call is exactly one store round trip. Nothing is cached.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::store::{ChildResource, ResourceKind, ResourceStore, StoreError};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ResourceApplier {
    store: Arc<dyn ResourceStore>,
}

impl ResourceApplier {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    pub async fn apply_create(&self, resource: &ChildResource) -> Result<(), StoreError> {
        match self.store.create(resource).await {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => {
                debug!(kind = %resource.kind(), name = %resource.name(), "already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn apply_patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store.patch(kind, namespace, name, patch).await
    }

    pub async fn apply_delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        match self.store.delete(kind, namespace, name).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                debug!(%kind, namespace, name, "already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read_exists(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        match self.store.get(kind, namespace, name).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_record(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.store.remove_record(namespace, name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
