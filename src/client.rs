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

//! Authoritative CRUD against the cluster.
//!
//! The reconciler talks to the apiserver only through [`ApiClient`], so it
//! can be driven by an in-memory implementation in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use thiserror::Error;

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "service-ingress-controller";

/// Errors returned by [`ApiClient`] calls.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The object does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the object, e.g. `Service`.
        kind: &'static str,
        /// Namespace of the object.
        namespace: String,
        /// Name of the object.
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Kind of the object, e.g. `Service`.
        kind: &'static str,
        /// Namespace of the object.
        namespace: String,
        /// Name of the object.
        name: String,
    },

    /// Anything else: network failures, conflicts, throttling.
    #[error("{kind} {namespace}/{name}: {source}")]
    Transient {
        /// Kind of the object, e.g. `Service`.
        kind: &'static str,
        /// Namespace of the object.
        namespace: String,
        /// Name of the object.
        name: String,
        /// Underlying client error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ApiError {
    /// Builds a transient error from any error value.
    pub fn transient(
        kind: &'static str,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ApiError::Transient {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            source: source.into(),
        }
    }

    /// Classifies a kube client error.
    ///
    /// 404 is `NotFound`, 409 with reason `AlreadyExists` is
    /// `AlreadyExists`; a 409 `Conflict` on update stays transient.
    pub fn from_kube(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ApiError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ApiError::AlreadyExists {
                    kind,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            }
            e => ApiError::transient(kind, namespace, name, e),
        }
    }

    /// Returns true for [`ApiError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    /// Returns true for [`ApiError::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }
}

/// Operations the reconciler needs from the apiserver.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Reads a Deployment.
    async fn get_primary(&self, namespace: &str, name: &str) -> Result<Deployment, ApiError>;

    /// Replaces a Deployment, returning the stored object.
    async fn update_primary(&self, deployment: &Deployment) -> Result<Deployment, ApiError>;

    /// Creates a Service.
    async fn create_service(&self, service: &Service) -> Result<Service, ApiError>;

    /// Reads a Service.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError>;

    /// Replaces a Service.
    async fn replace_service(&self, service: &Service) -> Result<Service, ApiError>;

    /// Deletes a Service.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ApiError>;

    /// Creates an Ingress.
    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ApiError>;

    /// Reads an Ingress.
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, ApiError>;

    /// Replaces an Ingress.
    async fn replace_ingress(&self, ingress: &Ingress) -> Result<Ingress, ApiError>;

    /// Deletes an Ingress.
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ApiError>;
}

/// [`ApiClient`] backed by a kube [`Client`].
#[derive(Clone)]
pub struct KubeApiClient {
    client: Client,
}

impl KubeApiClient {
    /// Wraps the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

const DEPLOYMENT: &str = "Deployment";
const SERVICE: &str = "Service";
const INGRESS: &str = "Ingress";

#[async_trait]
impl ApiClient for KubeApiClient {
    async fn get_primary(&self, namespace: &str, name: &str) -> Result<Deployment, ApiError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ApiError::from_kube(DEPLOYMENT, namespace, name, e))
    }

    async fn update_primary(&self, deployment: &Deployment) -> Result<Deployment, ApiError> {
        let namespace = deployment.namespace().unwrap_or_default();
        let name = deployment.name_any();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(), deployment)
            .await
            .map_err(|e| ApiError::from_kube(DEPLOYMENT, &namespace, &name, e))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ApiError> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), service)
            .await
            .map_err(|e| ApiError::from_kube(SERVICE, &namespace, &service.name_any(), e))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ApiError::from_kube(SERVICE, namespace, name, e))
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, ApiError> {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(), service)
            .await
            .map_err(|e| ApiError::from_kube(SERVICE, &namespace, &name, e))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ApiError::from_kube(SERVICE, namespace, name, e))
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ApiError> {
        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), ingress)
            .await
            .map_err(|e| ApiError::from_kube(INGRESS, &namespace, &ingress.name_any(), e))
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, ApiError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ApiError::from_kube(INGRESS, namespace, name, e))
    }

    async fn replace_ingress(&self, ingress: &Ingress) -> Result<Ingress, ApiError> {
        let namespace = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(), ingress)
            .await
            .map_err(|e| ApiError::from_kube(INGRESS, &namespace, &name, e))
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ApiError::from_kube(INGRESS, namespace, name, e))
    }
}
