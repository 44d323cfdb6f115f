// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reconciler behavior against an in-memory cluster.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use service_ingress_controller::informer::PrimaryLister;
use service_ingress_controller::reconciler::{ReconcileOutcome, Reconciler};
use service_ingress_controller::resources::{
    rewrite_target, NamespaceExclusionSet, QueueKey, ResourceKind,
};

use common::{deployment, selector, EmptyCache, FakeCluster};

fn reconciler(cluster: &Arc<FakeCluster>) -> Reconciler {
    reconciler_with_cache(cluster, cluster.clone())
}

fn reconciler_with_cache(cluster: &Arc<FakeCluster>, cache: Arc<dyn PrimaryLister>) -> Reconciler {
    Reconciler::new(
        cluster.clone(),
        cache,
        NamespaceExclusionSet::new("service-ingress-system", Vec::<String>::new()),
        "nginx",
    )
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_web_scenario() {
    let cluster = FakeCluster::new();
    let web = cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    let r = reconciler(&cluster);
    let key = QueueKey::primary("default", "web");

    assert_eq!(r.reconcile(&key).await, ReconcileOutcome::Handled);

    let svc = cluster.service("default", "web-svc").expect("service created");
    assert_eq!(selector(&svc), labels(&[("app", "web")]));
    let ports = svc.spec.as_ref().and_then(|s| s.ports.clone()).unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, 80);
    assert_eq!(ports[0].name.as_deref(), Some("http"));

    let ing = cluster.ingress("default", "web-ingress").expect("ingress created");
    let spec = ing.spec.as_ref().unwrap();
    assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
    let rules = spec.rules.as_ref().unwrap();
    let path = &rules[0].http.as_ref().unwrap().paths[0];
    assert_eq!(path.path.as_deref(), Some("/web-svc"));
    assert_eq!(path.path_type, "Prefix");
    let backend = path.backend.service.as_ref().unwrap();
    assert_eq!(backend.name, "web-svc");
    assert_eq!(backend.port.as_ref().and_then(|p| p.number), Some(80));

    // Both dependents point back at the Deployment.
    for owners in [svc.owner_references(), ing.owner_references()] {
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Deployment");
        assert_eq!(owners[0].name, "web");
        assert_eq!(Some(owners[0].uid.clone()), web.metadata.uid);
        assert_eq!(owners[0].controller, Some(true));
    }

    // Traceability labels were persisted on the Deployment.
    let stored = cluster.deployment("default", "web").unwrap();
    assert_eq!(stored.labels().get("svc").map(String::as_str), Some("web-svc"));
    assert_eq!(stored.labels().get("ingress").map(String::as_str), Some("web-ingress"));
    assert_eq!(stored.labels().get("app").map(String::as_str), Some("web"));

    cluster.remove_deployment("default", "web");
    assert_eq!(r.reconcile(&key).await, ReconcileOutcome::Handled);
    assert!(cluster.service("default", "web-svc").is_none());
    assert!(cluster.ingress("default", "web-ingress").is_none());
}

#[tokio::test]
async fn test_create_path_is_idempotent() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("shop", "cart", &[("app", "cart"), ("tier", "web")]));
    let r = reconciler(&cluster);
    let key = QueueKey::primary("shop", "cart");

    assert!(r.reconcile(&key).await.is_handled());
    let svc = cluster.service("shop", "cart-svc").unwrap();
    let ing = cluster.ingress("shop", "cart-ingress").unwrap();

    assert!(r.reconcile(&key).await.is_handled());
    assert_eq!(cluster.service_count(), 1);
    assert_eq!(cluster.ingress_count(), 1);
    assert_eq!(cluster.service("shop", "cart-svc").unwrap(), svc);
    assert_eq!(cluster.ingress("shop", "cart-ingress").unwrap(), ing);

    // Labels already in place: the second pass does not write the Deployment.
    assert_eq!(cluster.calls("update_primary"), 1);
    assert_eq!(cluster.calls("create_service"), 2);
}

#[tokio::test]
async fn test_delete_path_is_idempotent() {
    let cluster = FakeCluster::new();
    let r = reconciler(&cluster);
    let key = QueueKey::primary("default", "gone");

    assert!(r.reconcile(&key).await.is_handled());
    assert!(r.reconcile(&key).await.is_handled());
    assert_eq!(cluster.calls("delete_service"), 2);
    assert_eq!(cluster.calls("delete_ingress"), 2);
}

#[tokio::test]
async fn test_delete_after_partial_cleanup() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "api", &[("app", "api")]));
    let r = reconciler(&cluster);
    let key = QueueKey::primary("default", "api");
    assert!(r.reconcile(&key).await.is_handled());

    // The Service delete fails; the Ingress delete still happens.
    cluster.remove_deployment("default", "api");
    cluster.fail("delete_service", 1);
    assert_eq!(r.reconcile(&key).await, ReconcileOutcome::Requeue);
    assert!(cluster.service("default", "api-svc").is_some());
    assert!(cluster.ingress("default", "api-ingress").is_none());

    assert!(r.reconcile(&key).await.is_handled());
    assert!(cluster.service("default", "api-svc").is_none());
}

#[tokio::test]
async fn test_naming_is_deterministic() {
    let cluster = FakeCluster::new();
    let r = reconciler(&cluster);

    for name in ["a", "web", "payments-api", "x1"] {
        cluster.add_deployment(deployment("default", name, &[("app", name)]));
        assert!(r.reconcile(&QueueKey::primary("default", name)).await.is_handled());

        let svc = cluster.service("default", &format!("{name}-svc")).unwrap();
        let ing = cluster.ingress("default", &format!("{name}-ingress")).unwrap();
        assert_eq!(svc.owner_references()[0].name, name);
        assert_eq!(ing.owner_references()[0].name, name);
    }
    assert_eq!(cluster.service_count(), 4);
}

#[tokio::test]
async fn test_excluded_namespaces_are_untouched() {
    let cluster = FakeCluster::new();
    let r = reconciler(&cluster);

    for ns in ["kube-system", "kube-public", "service-ingress-system"] {
        cluster.add_deployment(deployment(ns, "coredns", &[("app", "coredns")]));
        let outcome = r.reconcile(&QueueKey::primary(ns, "coredns")).await;
        assert_eq!(outcome, ReconcileOutcome::Handled);
    }
    // Also when the Deployment does not exist.
    assert!(r.reconcile(&QueueKey::primary("kube-system", "missing")).await.is_handled());

    assert_eq!(cluster.calls("get_primary"), 0);
    assert_eq!(cluster.service_count(), 0);
    assert_eq!(cluster.ingress_count(), 0);
}

#[tokio::test]
async fn test_transient_create_failure_then_convergence() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    let r = reconciler(&cluster);
    let key = QueueKey::primary("default", "web");

    cluster.fail("create_ingress", 1);
    assert_eq!(r.reconcile(&key).await, ReconcileOutcome::Requeue);
    assert!(cluster.service("default", "web-svc").is_some());
    assert!(cluster.ingress("default", "web-ingress").is_none());

    // The Service now exists; the retry treats that as done.
    assert!(r.reconcile(&key).await.is_handled());
    assert!(cluster.ingress("default", "web-ingress").is_some());
}

#[tokio::test]
async fn test_transient_lookup_failure_requeues() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    let r = reconciler(&cluster);

    cluster.fail("get_primary", 1);
    assert_eq!(
        r.reconcile(&QueueKey::primary("default", "web")).await,
        ReconcileOutcome::Requeue
    );
    assert_eq!(cluster.calls("delete_service"), 0);
    assert_eq!(cluster.calls("create_service"), 0);
}

#[tokio::test]
async fn test_uncached_primary_uses_live_object() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "fresh", &[("app", "fresh")]));
    let r = reconciler_with_cache(&cluster, Arc::new(EmptyCache));

    assert!(r.reconcile(&QueueKey::primary("default", "fresh")).await.is_handled());
    let svc = cluster.service("default", "fresh-svc").unwrap();
    assert_eq!(selector(&svc), labels(&[("app", "fresh")]));
}

#[tokio::test]
async fn test_deleted_dependent_is_recreated() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    let r = reconciler(&cluster);
    assert!(r.reconcile(&QueueKey::primary("default", "web")).await.is_handled());

    cluster.remove_service("default", "web-svc");
    let key = QueueKey::new(ResourceKind::ServiceExposure, "default", "web-svc");
    assert!(r.reconcile(&key).await.is_handled());
    assert!(cluster.service("default", "web-svc").is_some());

    // A Service that does not follow the naming scheme is not ours.
    let foreign = QueueKey::new(ResourceKind::ServiceExposure, "default", "postgres");
    let before = cluster.calls("get_primary");
    assert!(r.reconcile(&foreign).await.is_handled());
    assert_eq!(cluster.calls("get_primary"), before);
}

fn drifted_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web-svc".to_string()),
            namespace: Some("default".to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.0.0.12".to_string()),
            selector: Some(labels(&[("app", "legacy")])),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 8080,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

#[tokio::test]
async fn test_drifted_service_left_alone_by_default() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    cluster.put_service(drifted_service());
    let r = reconciler(&cluster);

    assert!(r.reconcile(&QueueKey::primary("default", "web")).await.is_handled());
    let svc = cluster.service("default", "web-svc").unwrap();
    assert_eq!(selector(&svc), labels(&[("app", "legacy")]));
    assert_eq!(cluster.calls("replace_service"), 0);
}

#[tokio::test]
async fn test_drifted_service_replaced_when_enabled() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    cluster.put_service(drifted_service());
    let r = reconciler(&cluster).with_drift_overwrite(true);

    assert!(r.reconcile(&QueueKey::primary("default", "web")).await.is_handled());
    let svc = cluster.service("default", "web-svc").unwrap();
    let spec = svc.spec.as_ref().unwrap();
    assert_eq!(selector(&svc), labels(&[("app", "web")]));
    assert_eq!(spec.ports.as_ref().unwrap()[0].port, 80);
    // Server-assigned fields survive the replace.
    assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.12"));
    assert_eq!(cluster.calls("replace_service"), 1);

    // In sync now: no further writes.
    assert!(r.reconcile(&QueueKey::primary("default", "web")).await.is_handled());
    assert_eq!(cluster.calls("replace_service"), 1);
    assert_eq!(cluster.calls("replace_ingress"), 0);
}

fn drifted_ingress() -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some("web-ingress".to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(labels(&[("team", "storefront")])),
            ..ObjectMeta::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some("traefik".to_string()),
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/old".to_string()),
                        path_type: "Exact".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: "web-svc".to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(8080),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    }
}

fn first_path(ingress: &Ingress) -> HTTPIngressPath {
    ingress.spec.as_ref().unwrap().rules.as_ref().unwrap()[0]
        .http
        .as_ref()
        .unwrap()
        .paths[0]
        .clone()
}

#[tokio::test]
async fn test_drifted_ingress_left_alone_by_default() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    cluster.put_ingress(drifted_ingress());
    let r = reconciler(&cluster);

    assert!(r.reconcile(&QueueKey::primary("default", "web")).await.is_handled());
    let ing = cluster.ingress("default", "web-ingress").unwrap();
    assert_eq!(first_path(&ing).path.as_deref(), Some("/old"));
    assert_eq!(cluster.calls("get_ingress"), 0);
    assert_eq!(cluster.calls("replace_ingress"), 0);
}

#[tokio::test]
async fn test_drifted_ingress_replaced_when_enabled() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    cluster.put_ingress(drifted_ingress());
    let stale_version = cluster.ingress("default", "web-ingress").unwrap().resource_version();
    let r = reconciler(&cluster).with_drift_overwrite(true);

    assert!(r.reconcile(&QueueKey::primary("default", "web")).await.is_handled());
    // The replace carried the stored resourceVersion, so it was accepted.
    assert_eq!(cluster.calls("replace_ingress"), 1);
    let ing = cluster.ingress("default", "web-ingress").unwrap();
    assert_ne!(ing.resource_version(), stale_version);

    let spec = ing.spec.as_ref().unwrap();
    assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
    let path = first_path(&ing);
    assert_eq!(path.path.as_deref(), Some("/web-svc"));
    assert_eq!(path.path_type, "Prefix");
    let backend = path.backend.service.unwrap();
    assert_eq!(backend.name, "web-svc");
    assert_eq!(backend.port.unwrap().number, Some(80));

    assert_eq!(rewrite_target(&ing), Some("/"));
    assert_eq!(
        ing.annotations().get("team").map(String::as_str),
        Some("storefront")
    );

    // In sync now: no further writes.
    assert!(r.reconcile(&QueueKey::primary("default", "web")).await.is_handled());
    assert_eq!(cluster.calls("replace_ingress"), 1);
}

#[tokio::test]
async fn test_missing_rewrite_target_is_restored_when_enabled() {
    let cluster = FakeCluster::new();
    cluster.add_deployment(deployment("default", "web", &[("app", "web")]));
    let r = reconciler(&cluster).with_drift_overwrite(true);
    let key = QueueKey::primary("default", "web");
    assert!(r.reconcile(&key).await.is_handled());

    let mut ing = cluster.ingress("default", "web-ingress").unwrap();
    ing.annotations_mut().clear();
    cluster.put_ingress(ing);

    assert!(r.reconcile(&key).await.is_handled());
    let ing = cluster.ingress("default", "web-ingress").unwrap();
    assert_eq!(rewrite_target(&ing), Some("/"));
    assert_eq!(cluster.calls("replace_ingress"), 1);
}
