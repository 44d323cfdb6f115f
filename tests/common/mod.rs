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

//! In-memory cluster shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use service_ingress_controller::client::{ApiClient, ApiError};
use service_ingress_controller::informer::PrimaryLister;

type Key = (String, String);

#[derive(Default)]
struct State {
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    ingresses: BTreeMap<Key, Ingress>,
    failures: HashMap<&'static str, usize>,
    calls: HashMap<&'static str, usize>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// An apiserver holding Deployments, Services and Ingresses.
///
/// Calls can be made to fail a given number of times with a transient
/// error. Replaces enforce optimistic concurrency on `resourceVersion`.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn key(ns: &str, name: &str) -> Key {
    (ns.to_string(), name.to_string())
}

fn not_found(kind: &'static str, (namespace, name): Key) -> ApiError {
    ApiError::NotFound {
        kind,
        namespace,
        name,
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores a Deployment, assigning a uid and a resourceVersion.
    pub fn add_deployment(&self, mut deployment: Deployment) -> Deployment {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        if deployment.metadata.uid.is_none() {
            deployment.metadata.uid = Some(format!("uid-{}-{rv}", deployment.name_any()));
        }
        deployment.metadata.resource_version = Some(rv);
        state
            .deployments
            .insert(key_of(&deployment), deployment.clone());
        deployment
    }

    pub fn remove_deployment(&self, ns: &str, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.remove(&key(ns, name))
    }

    pub fn deployment(&self, ns: &str, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(&key(ns, name)).cloned()
    }

    pub fn service(&self, ns: &str, name: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(&key(ns, name)).cloned()
    }

    pub fn ingress(&self, ns: &str, name: &str) -> Option<Ingress> {
        self.state.lock().unwrap().ingresses.get(&key(ns, name)).cloned()
    }

    pub fn remove_service(&self, ns: &str, name: &str) -> Option<Service> {
        self.state.lock().unwrap().services.remove(&key(ns, name))
    }

    pub fn service_count(&self) -> usize {
        self.state.lock().unwrap().services.len()
    }

    pub fn ingress_count(&self) -> usize {
        self.state.lock().unwrap().ingresses.len()
    }

    /// Stores a Service directly, bypassing the controller.
    pub fn put_service(&self, mut service: Service) {
        let mut state = self.state.lock().unwrap();
        service.metadata.resource_version = Some(state.bump());
        state.services.insert(key_of(&service), service);
    }

    /// Stores an Ingress directly, bypassing the controller.
    pub fn put_ingress(&self, mut ingress: Ingress) {
        let mut state = self.state.lock().unwrap();
        ingress.metadata.resource_version = Some(state.bump());
        state.ingresses.insert(key_of(&ingress), ingress);
    }

    /// Makes the next `times` calls of `op` fail transiently.
    pub fn fail(&self, op: &'static str, times: usize) {
        self.state.lock().unwrap().failures.insert(op, times);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: &'static str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(op)
            .copied()
            .unwrap_or_default()
    }

    fn enter(&self, op: &'static str, kind: &'static str, key: &Key) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(ApiError::transient(
                    kind,
                    key.0.clone(),
                    key.1.clone(),
                    "injected failure",
                ))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ApiClient for FakeCluster {
    async fn get_primary(&self, namespace: &str, name: &str) -> Result<Deployment, ApiError> {
        let k = key(namespace, name);
        self.enter("get_primary", "Deployment", &k)?;
        self.deployment(namespace, name)
            .ok_or_else(|| not_found("Deployment", k))
    }

    async fn update_primary(&self, deployment: &Deployment) -> Result<Deployment, ApiError> {
        let k = key_of(deployment);
        self.enter("update_primary", "Deployment", &k)?;
        let mut state = self.state.lock().unwrap();
        let current = state
            .deployments
            .get(&k)
            .ok_or_else(|| not_found("Deployment", k.clone()))?;
        if current.metadata.resource_version != deployment.metadata.resource_version {
            return Err(ApiError::transient("Deployment", k.0, k.1, "conflict"));
        }
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.deployments.insert(k, stored.clone());
        Ok(stored)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ApiError> {
        let k = key_of(service);
        self.enter("create_service", "Service", &k)?;
        let mut state = self.state.lock().unwrap();
        if state.services.contains_key(&k) {
            return Err(ApiError::AlreadyExists {
                kind: "Service",
                namespace: k.0,
                name: k.1,
            });
        }
        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.services.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        let k = key(namespace, name);
        self.enter("get_service", "Service", &k)?;
        self.service(namespace, name)
            .ok_or_else(|| not_found("Service", k))
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, ApiError> {
        let k = key_of(service);
        self.enter("replace_service", "Service", &k)?;
        let mut state = self.state.lock().unwrap();
        let current = state
            .services
            .get(&k)
            .ok_or_else(|| not_found("Service", k.clone()))?;
        if current.metadata.resource_version != service.metadata.resource_version {
            return Err(ApiError::transient("Service", k.0, k.1, "conflict"));
        }
        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.services.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let k = key(namespace, name);
        self.enter("delete_service", "Service", &k)?;
        let mut state = self.state.lock().unwrap();
        state
            .services
            .remove(&k)
            .map(|_| ())
            .ok_or_else(|| not_found("Service", k))
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ApiError> {
        let k = key_of(ingress);
        self.enter("create_ingress", "Ingress", &k)?;
        let mut state = self.state.lock().unwrap();
        if state.ingresses.contains_key(&k) {
            return Err(ApiError::AlreadyExists {
                kind: "Ingress",
                namespace: k.0,
                name: k.1,
            });
        }
        let mut stored = ingress.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.ingresses.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, ApiError> {
        let k = key(namespace, name);
        self.enter("get_ingress", "Ingress", &k)?;
        self.ingress(namespace, name)
            .ok_or_else(|| not_found("Ingress", k))
    }

    async fn replace_ingress(&self, ingress: &Ingress) -> Result<Ingress, ApiError> {
        let k = key_of(ingress);
        self.enter("replace_ingress", "Ingress", &k)?;
        let mut state = self.state.lock().unwrap();
        let current = state
            .ingresses
            .get(&k)
            .ok_or_else(|| not_found("Ingress", k.clone()))?;
        if current.metadata.resource_version != ingress.metadata.resource_version {
            return Err(ApiError::transient("Ingress", k.0, k.1, "conflict"));
        }
        let mut stored = ingress.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.ingresses.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let k = key(namespace, name);
        self.enter("delete_ingress", "Ingress", &k)?;
        let mut state = self.state.lock().unwrap();
        state
            .ingresses
            .remove(&k)
            .map(|_| ())
            .ok_or_else(|| not_found("Ingress", k))
    }
}

/// A watch cache that always mirrors the cluster.
impl PrimaryLister for FakeCluster {
    fn get_primary(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.deployment(namespace, name).map(Arc::new)
    }
}

/// A watch cache that has not observed anything yet.
pub struct EmptyCache;

impl PrimaryLister for EmptyCache {
    fn get_primary(&self, _: &str, _: &str) -> Option<Arc<Deployment>> {
        None
    }
}

/// A Deployment whose pod template carries `labels`.
pub fn deployment(ns: &str, name: &str, labels: &[(&str, &str)]) -> Deployment {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: None,
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    }
}

/// Selector of a Service.
pub fn selector(service: &Service) -> BTreeMap<String, String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.clone())
        .unwrap_or_default()
}
