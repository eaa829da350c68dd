/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines the Prometheus metrics that the preview operator
* exposes. They describe the lifecycle of the preview environments it
* manages: how many were created, how many failed and at which step, how many
* are currently alive, how often each PR was reconciled, how many expired, and
* how long a full provisioning takes.
*
* Rather than process-wide statics, the metrics live in a `PreviewMetrics`
* value that owns its own `Registry`. `main` creates one at startup and hands
* an `Arc` of it to the reconciliation engine and the `/metrics` endpoint;
* tests create a fresh one per case. All prometheus metric types update with
* atomic operations, so one instance is shared freely between reconcile tasks.
*
* SPDX-License-Identifier: Apache-2.0
*/

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Label value used when a record carries no branch name or no PR number.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Every value `preview_environments_failed_total{step}` can take.
pub const FAILURE_STEPS: [&str; 6] = [
    "namespace",
    "deployment",
    "service",
    "ingress",
    "network_policy",
    "update",
];

pub const UPDATE_STEP: &str = "update";

pub struct PreviewMetrics {
    registry: Registry,
    /// Environments fully provisioned, labelled by branch.
    pub created_total: IntCounterVec,
    /// Failed provisioning or update attempts, labelled by the failing step.
    pub failed_total: IntCounterVec,
    /// Environments currently alive.
    pub active: IntGauge,
    /// Create and update transitions, labelled by PR number.
    pub reconcile_total: IntCounterVec,
    /// Records removed by the TTL sweep.
    pub expired_total: IntCounter,
    /// Wall-clock time of a full create transition, in seconds.
    pub creation_duration: Histogram,
}

impl PreviewMetrics {
    /// Creates every metric, registers it in a new registry and pre-registers
    /// the known label values so the series exist before the first event.
    pub fn new() -> Result<Self, prometheus::Error> {
        let created_total = IntCounterVec::new(
            Opts::new(
                "preview_environments_created_total",
                "Total preview environments successfully created",
            ),
            &["branch_name"],
        )?;
        let failed_total = IntCounterVec::new(
            Opts::new(
                "preview_environments_failed_total",
                "Total preview environment creation failures",
            ),
            &["step"],
        )?;
        let active = IntGauge::new(
            "preview_environments_active",
            "Currently active preview environments",
        )?;
        let reconcile_total = IntCounterVec::new(
            Opts::new(
                "preview_environments_reconcile_total",
                "Total reconciliation events per PR",
            ),
            &["pr_number"],
        )?;
        let expired_total = IntCounter::new(
            "preview_environments_expired_total",
            "Total preview environments removed after their TTL elapsed",
        )?;
        let creation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "preview_environment_creation_duration_seconds",
                "Time to fully provision a preview environment",
            )
            // +Inf is always appended by the client library.
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0]),
        )?;

        let registry = Registry::new();
        registry.register(Box::new(created_total.clone()))?;
        registry.register(Box::new(failed_total.clone()))?;
        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(expired_total.clone()))?;
        registry.register(Box::new(creation_duration.clone()))?;

        created_total.with_label_values(&[UNKNOWN_LABEL]);
        for step in FAILURE_STEPS {
            failed_total.with_label_values(&[step]);
        }
        reconcile_total.with_label_values(&[UNKNOWN_LABEL]);

        Ok(Self {
            registry,
            created_total,
            failed_total,
            active,
            reconcile_total,
            expired_total,
            creation_duration,
        })
    }

    pub fn record_created(&self, branch_name: Option<&str>, elapsed: Duration) {
        let branch = branch_name.filter(|b| !b.is_empty()).unwrap_or(UNKNOWN_LABEL);
        self.creation_duration.observe(elapsed.as_secs_f64());
        self.created_total.with_label_values(&[branch]).inc();
    }

    pub fn record_failure(&self, step: &str) {
        self.failed_total.with_label_values(&[step]).inc();
    }

    pub fn record_reconcile(&self, pr_number: u64) {
        self.reconcile_total
            .with_label_values(&[pr_number.to_string().as_str()])
            .inc();
    }

    pub fn record_expired(&self) {
        self.expired_total.inc();
    }

    pub fn environment_activated(&self) {
        self.active.inc();
    }

    pub fn environment_removed(&self) {
        self.active.dec();
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_values_are_preregistered() {
        let metrics = PreviewMetrics::new().unwrap();
        let text = metrics.encode().unwrap();

        assert!(text.contains(r#"preview_environments_created_total{branch_name="unknown"} 0"#));
        for step in FAILURE_STEPS {
            assert!(
                text.contains(&format!(r#"preview_environments_failed_total{{step="{step}"}} 0"#)),
                "missing step {step}"
            );
        }
        assert!(text.contains(r#"preview_environments_reconcile_total{pr_number="unknown"} 0"#));
        assert!(text.contains("preview_environments_active 0"));
        assert!(text.contains("preview_environments_expired_total 0"));
    }

    #[test]
    fn test_record_created_uses_sentinel_for_missing_branch() {
        let metrics = PreviewMetrics::new().unwrap();
        metrics.record_created(None, Duration::from_millis(1500));
        metrics.record_created(Some(""), Duration::from_millis(10));
        metrics.record_created(Some("feature-x"), Duration::from_secs(3));

        assert_eq!(metrics.created_total.with_label_values(&[UNKNOWN_LABEL]).get(), 2);
        assert_eq!(metrics.created_total.with_label_values(&["feature-x"]).get(), 1);
        assert_eq!(metrics.creation_duration.get_sample_count(), 3);
    }

    #[test]
    fn test_active_gauge_moves_both_ways() {
        let metrics = PreviewMetrics::new().unwrap();
        metrics.environment_activated();
        metrics.environment_activated();
        metrics.environment_removed();
        assert_eq!(metrics.active.get(), 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = PreviewMetrics::new().unwrap();
        let b = PreviewMetrics::new().unwrap();
        a.record_reconcile(142);
        assert_eq!(a.reconcile_total.with_label_values(&["142"]).get(), 1);
        assert_eq!(b.reconcile_total.with_label_values(&["142"]).get(), 0);
    }
}
