/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to the
* `PreviewEnvironment` Custom Resource Definition. By using the
* `kube::CustomResource` derive macro, we get a strongly-typed representation
* of the API, and `schemars` generates the OpenAPI v3 schema embedded in the
* CRD manifest (printed by `preview-operator crd`).
*
* Architecture:
* - Spec fields are snake_case (`pr_number`, `image_tag`, ...) so existing
*   `devops.orima.com/v1` manifests apply unchanged.
* - `image` and `image_tag` are optional in the schema. The reconciliation
*   engine rejects a record missing either of them as a permanent failure,
*   which lets it report a readable status instead of an admission error.
* - The status subresource is written only by the operator and records the
*   lifecycle phase together with the names of the child resources.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "devops.orima.com";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "devops.orima.com",
    version = "v1",
    kind = "PreviewEnvironment",
    plural = "previewenvironments",
    namespaced,
    status = "PreviewEnvironmentStatus",
    printcolumn = r#"{"name":"PR", "type":"integer", "jsonPath":".spec.pr_number"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "pvenv"
)]
pub struct PreviewEnvironmentSpec {
    /// Pull request number. Every derived resource name is built from it.
    pub pr_number: u64,

    /// Source branch. Only used as a metrics label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,

    /// Container image repository, e.g. `org/app`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image version selector, e.g. `v2.1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Lifetime measured from the record's creation. Absent means never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl PreviewEnvironmentSpec {
    /// `<image>:<image_tag>`, or `None` unless both parts are present and non-empty.
    pub fn image_reference(&self) -> Option<String> {
        let image = self.image.as_deref().filter(|s| !s.is_empty())?;
        let tag = self.image_tag.as_deref().filter(|s| !s.is_empty())?;
        Some(format!("{image}:{tag}"))
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum EnvironmentPhase {
    Creating,
    Active,
    Failed,
    Deleting,
    /// The namespace deletion was accepted and the active gauge released.
    /// Only the finalizer removal is left.
    Deleted,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEnvironmentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<EnvironmentPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Image reference the workload was last created or patched with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// RFC 3339 time of the last status change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}
