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

//! Resource model and synthesis of the dependent objects.
//!
//! A Deployment (the primary) is exposed through a Service named
//! `<name>-svc` and an Ingress named `<name>-ingress`. Everything here is a
//! pure function of its inputs, so synthesizing twice yields identical
//! objects.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use thiserror::Error;

/// Suffix appended to the primary name to form the Service name.
pub const SERVICE_SUFFIX: &str = "-svc";

/// Suffix appended to the primary name to form the Ingress name.
pub const INGRESS_SUFFIX: &str = "-ingress";

/// Name of the single port exposed by the Service.
pub const HTTP_PORT_NAME: &str = "http";

/// Port exposed by the Service and targeted by the Ingress backend.
pub const HTTP_PORT: i32 = 80;

/// Annotation instructing ingress-nginx to strip the routing prefix.
pub const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";

/// Ingress class used when none is configured.
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";

/// Path type of the generated Ingress rule.
pub const PATH_TYPE_PREFIX: &str = "Prefix";

/// Traceability label pointing at the Service.
pub const LABEL_SERVICE: &str = "svc";

/// Traceability label pointing at the Ingress.
pub const LABEL_INGRESS: &str = "ingress";

/// Traceability label naming the application.
pub const LABEL_APP: &str = "app";

/// Namespaces owned by the platform that are never reconciled.
pub const SYSTEM_NAMESPACES: &[&str] = &[
    "kube-node-lease",
    "kube-public",
    "kube-system",
    "local-path-storage",
    "ingress-nginx",
];

/// Kind of object a queue key was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The watched Deployment.
    Primary,
    /// The Service exposing a Deployment.
    ServiceExposure,
    /// The Ingress routing to the Service.
    IngressRoute,
}

impl ResourceKind {
    /// Kubernetes kind name, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Primary => "Deployment",
            ResourceKind::ServiceExposure => "Service",
            ResourceKind::IngressRoute => "Ingress",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when parsing a queue key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The string is not of the form `<namespace>/<name>`.
    #[error("invalid key {0:?}: expected <namespace>/<name>")]
    Malformed(String),
}

/// Unit of deduplication and retry in the reconcile queue.
///
/// Displays as `namespace/name`; the kind tag records which watched object
/// produced the key. Keys compare equal when they resolve to the same
/// Deployment, so a Deployment and its dependents share one queue entry
/// and one retry history. Keys of foreign dependents compare by kind and
/// name.
#[derive(Debug, Clone)]
pub struct QueueKey {
    /// Kind of the object that triggered the key.
    pub kind: ResourceKind,
    /// Namespace of the object.
    pub namespace: String,
    /// Name of the object.
    pub name: String,
}

impl QueueKey {
    /// Creates a new key.
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a key for a primary resource.
    pub fn primary(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Primary, namespace, name)
    }

    /// Builds a key from any namespaced object.
    ///
    /// Cluster-scoped objects (no namespace) map to the empty namespace.
    pub fn for_object<K: kube::Resource>(kind: ResourceKind, obj: &K) -> Self {
        Self::new(kind, obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// Parses a `namespace/name` string into a key of the given kind.
    pub fn parse(kind: ResourceKind, s: &str) -> Result<Self, KeyError> {
        match s.split_once('/') {
            Some((ns, name)) if !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(kind, ns, name))
            }
            None if !s.is_empty() => Ok(Self::new(kind, "", s)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }

    /// Returns the name of the Deployment this key belongs to.
    ///
    /// Dependent keys are mapped back through the naming scheme. Returns
    /// `None` for a dependent that does not follow it.
    pub fn primary_name(&self) -> Option<&str> {
        let suffix = match self.kind {
            ResourceKind::Primary => return Some(&self.name),
            ResourceKind::ServiceExposure => SERVICE_SUFFIX,
            ResourceKind::IngressRoute => INGRESS_SUFFIX,
        };
        self.name
            .strip_suffix(suffix)
            .filter(|owner| !owner.is_empty())
    }
}

#[derive(PartialEq, Eq, Hash)]
enum Identity<'a> {
    Owner(&'a str),
    Foreign(ResourceKind, &'a str),
}

impl QueueKey {
    fn identity(&self) -> (&str, Identity<'_>) {
        let id = match self.primary_name() {
            Some(owner) => Identity::Owner(owner),
            None => Identity::Foreign(self.kind, &self.name),
        };
        (&self.namespace, id)
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for QueueKey {}

impl Hash for QueueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for QueueKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(ResourceKind::Primary, s)
    }
}

/// Namespaces the reconciler never touches.
#[derive(Debug, Clone, Default)]
pub struct NamespaceExclusionSet {
    namespaces: HashSet<String>,
}

impl NamespaceExclusionSet {
    /// Builds the set from the platform namespaces, the controller's own
    /// namespace and any extra names.
    pub fn new(
        controller_namespace: &str,
        extra: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut namespaces: HashSet<String> =
            SYSTEM_NAMESPACES.iter().map(|ns| ns.to_string()).collect();
        if !controller_namespace.is_empty() {
            namespaces.insert(controller_namespace.to_string());
        }
        namespaces.extend(extra.into_iter().map(Into::into));
        Self { namespaces }
    }

    /// Returns true if `namespace` must not be reconciled.
    pub fn contains(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    /// Number of excluded namespaces.
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Returns true if nothing is excluded.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

/// Name of the Service exposing the Deployment `primary`.
pub fn service_name(primary: &str) -> String {
    format!("{primary}{SERVICE_SUFFIX}")
}

/// Name of the Ingress routing to the Deployment `primary`.
pub fn ingress_name(primary: &str) -> String {
    format!("{primary}{INGRESS_SUFFIX}")
}

/// Routing path for a Service.
pub fn ingress_path(service: &str) -> String {
    format!("/{service}")
}

/// Traceability labels for the Deployment `primary`.
pub fn traceability_labels(primary: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_SERVICE.to_string(), service_name(primary)),
        (LABEL_INGRESS.to_string(), ingress_name(primary)),
        (LABEL_APP.to_string(), primary.to_string()),
    ])
}

/// Merges the traceability labels into the Deployment's label map.
///
/// Labels set by anyone else are kept. Returns `true` if the map changed.
pub fn apply_traceability_labels(deployment: &mut Deployment) -> bool {
    let name = deployment.name_any();
    let labels = deployment.labels_mut();
    let mut changed = false;
    for (key, value) in traceability_labels(&name) {
        if labels.get(&key) != Some(&value) {
            labels.insert(key, value);
            changed = true;
        }
    }
    changed
}

/// Labels of the Deployment's pod template.
pub fn pod_template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default()
}

/// Owner link from a dependent back to its Deployment.
pub fn owner_link(deployment: &Deployment) -> OwnerReference {
    OwnerReference {
        api_version: <Deployment as k8s_openapi::Resource>::API_VERSION.to_string(),
        kind: <Deployment as k8s_openapi::Resource>::KIND.to_string(),
        name: deployment.name_any(),
        uid: deployment.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

/// Desired Service for a Deployment.
pub fn desired_service(deployment: &Deployment) -> Service {
    let name = deployment.name_any();
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&name)),
            namespace: deployment.namespace(),
            owner_references: Some(vec![owner_link(deployment)]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(pod_template_labels(deployment)),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::Int(HTTP_PORT)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Desired Ingress for a Service.
///
/// The Ingress shares the Service's owner link, so it stays traceable to
/// the Deployment that caused both.
pub fn desired_ingress(service: &Service, ingress_class: &str) -> Ingress {
    let svc_name = service.name_any();
    let primary = svc_name
        .strip_suffix(SERVICE_SUFFIX)
        .unwrap_or(svc_name.as_str());

    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(primary)),
            namespace: service.namespace(),
            annotations: Some(BTreeMap::from([(
                REWRITE_TARGET_ANNOTATION.to_string(),
                "/".to_string(),
            )])),
            owner_references: service.metadata.owner_references.clone(),
            ..ObjectMeta::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(ingress_class.to_string()),
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(ingress_path(&svc_name)),
                        path_type: PATH_TYPE_PREFIX.to_string(),
                        backend: IngressBackend {
                            resource: None,
                            service: Some(IngressServiceBackend {
                                name: svc_name.clone(),
                                port: Some(ServiceBackendPort {
                                    name: None,
                                    number: Some(HTTP_PORT),
                                }),
                            }),
                        },
                    }],
                }),
            }]),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    }
}

/// Returns true if `existing` no longer matches the selector or ports of
/// `desired`.
///
/// Server-defaulted fields (protocol, cluster IP) are ignored.
pub fn service_drifted(existing: &Service, desired: &Service) -> bool {
    let selector = |svc: &Service| {
        svc.spec
            .as_ref()
            .and_then(|s| s.selector.clone())
            .unwrap_or_default()
    };
    let ports = |svc: &Service| -> Vec<(Option<String>, i32)> {
        svc.spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().map(|p| (p.name.clone(), p.port)).collect())
            .unwrap_or_default()
    };
    selector(existing) != selector(desired) || ports(existing) != ports(desired)
}

/// Returns true if `existing` no longer matches the class, rules or
/// rewrite-target annotation of `desired`.
///
/// Other annotations are left to whoever set them.
pub fn ingress_drifted(existing: &Ingress, desired: &Ingress) -> bool {
    let class = |ing: &Ingress| ing.spec.as_ref().and_then(|s| s.ingress_class_name.clone());
    let rules = |ing: &Ingress| ing.spec.as_ref().and_then(|s| s.rules.clone());
    class(existing) != class(desired)
        || rules(existing) != rules(desired)
        || rewrite_target(existing) != rewrite_target(desired)
}

/// Value of the rewrite-target annotation on `ingress`.
pub fn rewrite_target(ingress: &Ingress) -> Option<&str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REWRITE_TARGET_ANNOTATION))
        .map(String::as_str)
}
