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

//! Decide-and-apply logic for a single queue key.
//!
//! A key resolves to a Deployment. If the Deployment exists, its Service
//! and Ingress are created; if it is gone, both are deleted. Every step
//! tolerates having already been done, so a key can be retried after a
//! partial failure without any bookkeeping.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::{ApiClient, ApiError};
use crate::informer::PrimaryLister;
use crate::resources::{
    apply_traceability_labels, desired_ingress, desired_service, ingress_drifted, ingress_name,
    owner_link, rewrite_target, service_drifted, service_name, NamespaceExclusionSet, QueueKey,
    REWRITE_TARGET_ANNOTATION,
};

/// Result of reconciling one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The cluster matches the desired state; retry history can be dropped.
    Handled,
    /// Something failed; the key should be retried with backoff.
    Requeue,
}

impl ReconcileOutcome {
    /// Returns true for [`ReconcileOutcome::Handled`].
    pub fn is_handled(&self) -> bool {
        matches!(self, ReconcileOutcome::Handled)
    }
}

/// Stateless reconciler shared by all workers.
pub struct Reconciler {
    api: Arc<dyn ApiClient>,
    lister: Arc<dyn PrimaryLister>,
    excluded: NamespaceExclusionSet,
    ingress_class: String,
    overwrite_drift: bool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("excluded", &self.excluded)
            .field("ingress_class", &self.ingress_class)
            .field("overwrite_drift", &self.overwrite_drift)
            .finish()
    }
}

impl Reconciler {
    /// Creates a reconciler.
    pub fn new(
        api: Arc<dyn ApiClient>,
        lister: Arc<dyn PrimaryLister>,
        excluded: NamespaceExclusionSet,
        ingress_class: impl Into<String>,
    ) -> Self {
        Self {
            api,
            lister,
            excluded,
            ingress_class: ingress_class.into(),
            overwrite_drift: false,
        }
    }

    /// Replace existing dependents whose spec drifted from the desired one.
    pub fn with_drift_overwrite(mut self, enabled: bool) -> Self {
        self.overwrite_drift = enabled;
        self
    }

    /// Reconciles the Deployment `key` refers to.
    pub async fn reconcile(&self, key: &QueueKey) -> ReconcileOutcome {
        let Some(name) = key.primary_name() else {
            debug!(%key, kind = %key.kind, "not a managed dependent, ignoring");
            return ReconcileOutcome::Handled;
        };
        let namespace = key.namespace.as_str();

        if self.excluded.contains(namespace) {
            debug!(%key, "namespace excluded, skipping");
            return ReconcileOutcome::Handled;
        }

        let result = match self.api.get_primary(namespace, name).await {
            Ok(primary) => self.sync(namespace, name, primary).await,
            Err(e) if e.is_not_found() => self.cleanup(namespace, name).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => ReconcileOutcome::Handled,
            Err(e) => {
                warn!(%key, error = %e, "reconcile failed");
                ReconcileOutcome::Requeue
            }
        }
    }

    /// Deletes both dependents of a Deployment that no longer exists.
    async fn cleanup(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let svc = service_name(name);
        let ing = ingress_name(name);

        // Both deletes run even if the first one fails.
        let service = absent_ok(self.api.delete_service(namespace, &svc).await);
        let ingress = absent_ok(self.api.delete_ingress(namespace, &ing).await);

        if service.is_ok() && ingress.is_ok() {
            info!(namespace, deployment = name, service = %svc, ingress = %ing, "dependents removed");
        }
        service.and(ingress)
    }

    /// Brings the dependents of an existing Deployment into place.
    async fn sync(&self, namespace: &str, name: &str, mut primary: Deployment) -> Result<(), ApiError> {
        // Selector and ports come from the watch cache; it may lag behind a Deployment
        // that was just created.
        let cached = self.lister.get_primary(namespace, name);
        if cached.is_none() {
            debug!(namespace, deployment = name, "not cached yet, using live object");
        }

        if apply_traceability_labels(&mut primary) {
            primary = self.api.update_primary(&primary).await?;
            debug!(namespace, deployment = name, "traceability labels applied");
        }

        let source = cached.as_deref().unwrap_or(&primary);
        let mut service = desired_service(source);
        // The owner link always names the live object.
        service.metadata.owner_references = Some(vec![owner_link(&primary)]);

        match self.api.create_service(&service).await {
            Ok(created) => info!(namespace, deployment = name, service = %created.name_any(), "service created"),
            Err(e) if e.is_already_exists() => {
                if self.overwrite_drift {
                    self.converge_service(&service).await?;
                }
            }
            Err(e) => return Err(e),
        }

        let ingress = desired_ingress(&service, &self.ingress_class);
        match self.api.create_ingress(&ingress).await {
            Ok(created) => info!(namespace, deployment = name, ingress = %created.name_any(), "ingress created"),
            Err(e) if e.is_already_exists() => {
                if self.overwrite_drift {
                    self.converge_ingress(&ingress).await?;
                }
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Replaces the selector and ports of an existing Service if they drifted.
    async fn converge_service(&self, desired: &Service) -> Result<(), ApiError> {
        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();
        let existing = self.api.get_service(&namespace, &name).await?;
        if !service_drifted(&existing, desired) {
            return Ok(());
        }

        let mut replacement = existing;
        let spec = replacement.spec.get_or_insert_with(Default::default);
        let wanted = desired.spec.clone().unwrap_or_default();
        spec.selector = wanted.selector;
        spec.ports = wanted.ports;

        self.api.replace_service(&replacement).await?;
        info!(namespace = %namespace, service = %name, "drifted service replaced");
        Ok(())
    }

    /// Replaces the class, rules and rewrite target of an existing Ingress if
    /// they drifted.
    async fn converge_ingress(&self, desired: &Ingress) -> Result<(), ApiError> {
        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();
        let existing = self.api.get_ingress(&namespace, &name).await?;
        if !ingress_drifted(&existing, desired) {
            return Ok(());
        }

        let mut replacement = existing;
        let spec = replacement.spec.get_or_insert_with(Default::default);
        let wanted = desired.spec.clone().unwrap_or_default();
        spec.ingress_class_name = wanted.ingress_class_name;
        spec.rules = wanted.rules;
        if let Some(target) = rewrite_target(desired) {
            replacement
                .annotations_mut()
                .insert(REWRITE_TARGET_ANNOTATION.to_string(), target.to_string());
        }

        self.api.replace_ingress(&replacement).await?;
        info!(namespace = %namespace, ingress = %name, "drifted ingress replaced");
        Ok(())
    }
}

/// Treats a missing object as successfully deleted.
fn absent_ok(result: Result<(), ApiError>) -> Result<(), ApiError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
