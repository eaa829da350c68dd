/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/builders.rs
*
* Pure constructors for the child resources of a preview environment. Each
* function takes the derived names (plus whatever configuration it needs) and
* returns a typed `k8s-openapi` object. Nothing here performs I/O, so the
* desired shape of an environment can be asserted directly in unit tests.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::names::DerivedNames;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, Namespace, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, NetworkPolicy, NetworkPolicyEgressRule,
    NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
    ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub const CONTAINER_NAME: &str = "app";
pub const CONTAINER_PORT: i32 = 80;
pub const ENDPOINT_PORT: i32 = 80;
pub const HEALTH_CHECK_PATH: &str = "/";

pub const APP_LABEL: &str = "app";
pub const PR_LABEL: &str = "devops.orima.com/pr-number";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "preview-operator";
pub const CLUSTER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";

fn common_labels(names: &DerivedNames) -> BTreeMap<String, String> {
    [
        (PR_LABEL.to_string(), names.pr_number.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ]
    .into()
}

fn app_selector(names: &DerivedNames) -> BTreeMap<String, String> {
    [(APP_LABEL.to_string(), names.workload_name.clone())].into()
}

fn metadata(name: &str, names: &DerivedNames) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(names.namespace.clone()),
        labels: Some(common_labels(names)),
        ..Default::default()
    }
}

pub fn build_namespace(names: &DerivedNames) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(names.namespace.clone()),
            labels: Some(common_labels(names)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_CHECK_PATH.to_string()),
            port: IntOrString::Int(CONTAINER_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(2),
        period_seconds: Some(5),
        timeout_seconds: Some(2),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Single-replica Deployment running `image_reference` (`<image>:<tag>`).
pub fn build_workload(names: &DerivedNames, image_reference: &str) -> Deployment {
    let mut pod_labels = common_labels(names);
    pod_labels.extend(app_selector(names));

    Deployment {
        metadata: metadata(&names.workload_name, names),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_selector(names)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(image_reference.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: CONTAINER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        resources: Some(ResourceRequirements {
                            requests: Some(
                                [
                                    ("cpu".to_string(), Quantity("100m".to_string())),
                                    ("memory".to_string(), Quantity("128Mi".to_string())),
                                ]
                                .into(),
                            ),
                            limits: Some(
                                [
                                    ("cpu".to_string(), Quantity("250m".to_string())),
                                    ("memory".to_string(), Quantity("256Mi".to_string())),
                                ]
                                .into(),
                            ),
                            ..Default::default()
                        }),
                        liveness_probe: Some(health_probe()),
                        readiness_probe: Some(health_probe()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service forwarding port 80 to the workload's container port.
pub fn build_endpoint(names: &DerivedNames) -> Service {
    Service {
        metadata: metadata(&names.endpoint_name, names),
        spec: Some(ServiceSpec {
            selector: Some(app_selector(names)),
            ports: Some(vec![ServicePort {
                port: ENDPOINT_PORT,
                target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress for `names.host` with TLS terminated by a cert-manager issued secret.
pub fn build_route(names: &DerivedNames, cluster_issuer: &str) -> Ingress {
    let mut meta = metadata(&names.route_name, names);
    meta.annotations = Some(
        [(
            CLUSTER_ISSUER_ANNOTATION.to_string(),
            cluster_issuer.to_string(),
        )]
        .into(),
    );

    Ingress {
        metadata: meta,
        spec: Some(IngressSpec {
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![names.host.clone()]),
                secret_name: Some(names.tls_secret_name.clone()),
            }]),
            rules: Some(vec![IngressRule {
                host: Some(names.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: names.endpoint_name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(ENDPOINT_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tcp_port(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn same_namespace_peer() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(LabelSelector::default()),
        ..Default::default()
    }
}

/// NetworkPolicy confining the workload to traffic from its own namespace and
/// the ingress controller, with egress limited to the namespace and DNS.
pub fn build_isolation_policy(names: &DerivedNames, ingress_namespace: &str) -> NetworkPolicy {
    let ingress_controller = NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(
                [(
                    "kubernetes.io/metadata.name".to_string(),
                    ingress_namespace.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };

    let dns_ports = vec![
        NetworkPolicyPort {
            port: Some(IntOrString::Int(53)),
            protocol: Some("UDP".to_string()),
            ..Default::default()
        },
        tcp_port(53),
    ];

    let pod_selector = LabelSelector {
        match_labels: Some(app_selector(names)),
        ..Default::default()
    };

    NetworkPolicy {
        metadata: metadata(&names.policy_name, names),
        spec: Some(NetworkPolicySpec {
            // `podSelector` changed from required to optional between Kubernetes
            // releases; `into()` fits either field type.
            pod_selector: pod_selector.into(),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![same_namespace_peer(), ingress_controller]),
                ports: Some(vec![tcp_port(CONTAINER_PORT)]),
            }]),
            egress: Some(vec![
                NetworkPolicyEgressRule {
                    to: Some(vec![same_namespace_peer()]),
                    ports: None,
                },
                NetworkPolicyEgressRule {
                    to: None,
                    ports: Some(dns_ports),
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
