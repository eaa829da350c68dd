/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/names.rs
*
* Deterministic naming for preview environments. Every transition (create,
* update, delete, resume, expiry) re-derives the names from the PR number, so
* no mapping from record to child resources has to be stored anywhere.
*
* SPDX-License-Identifier: Apache-2.0
*/

/// The names of every object belonging to one preview environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivedNames {
    pub pr_number: u64,
    pub namespace: String,
    pub workload_name: String,
    pub endpoint_name: String,
    pub route_name: String,
    pub policy_name: String,
    pub host: String,
    pub tls_secret_name: String,
}

impl DerivedNames {
    /// Externally reachable URL of the environment.
    pub fn url(&self) -> String {
        format!("https://{}", self.host)
    }
}

/// Derives all names for `pr_number`. The number is rendered in full decimal
/// form, so distinct PR numbers never share a name.
pub fn derive(pr_number: u64, base_domain: &str) -> DerivedNames {
    let prefix = format!("pr-{pr_number}");
    DerivedNames {
        pr_number,
        namespace: format!("preview-{prefix}"),
        workload_name: format!("{prefix}-app"),
        endpoint_name: format!("{prefix}-svc"),
        route_name: format!("{prefix}-ingress"),
        policy_name: format!("{prefix}-isolation"),
        host: format!("{prefix}.preview.{base_domain}"),
        tls_secret_name: format!("{prefix}-tls"),
    }
}
