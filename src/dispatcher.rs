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

//! Turns informer notifications into queue keys.
//!
//! Deployments are observed on add and delete; Services and Ingresses only
//! on delete, so a dependent removed by hand is recreated. Nothing is
//! filtered here: deciding what a key means is the reconciler's job.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;

use crate::informer::{InformerFactory, ResourceEventHandler};
use crate::queue::RateLimitingQueue;
use crate::resources::{pod_template_labels, QueueKey, ResourceKind};

/// Enqueues a key for every relevant watch notification.
#[derive(Debug)]
pub struct EventDispatcher {
    queue: Arc<RateLimitingQueue<QueueKey>>,
    resync_on_update: bool,
}

impl EventDispatcher {
    /// Creates a dispatcher feeding `queue`.
    pub fn new(queue: Arc<RateLimitingQueue<QueueKey>>) -> Self {
        Self {
            queue,
            resync_on_update: false,
        }
    }

    /// Also enqueue Deployments whose pod-template labels changed.
    pub fn with_resync_on_update(mut self, enabled: bool) -> Self {
        self.resync_on_update = enabled;
        self
    }

    /// Registers the dispatcher with every informer.
    pub fn register(self: &Arc<Self>, informers: &InformerFactory) {
        informers.deployments.add_event_handler(self.clone());
        informers.services.add_event_handler(self.clone());
        informers.ingresses.add_event_handler(self.clone());
    }

    fn enqueue<K: kube::Resource>(&self, kind: ResourceKind, obj: &K, event: &str) {
        let key = QueueKey::for_object(kind, obj);
        tracing::debug!(%kind, %key, event, "enqueue");
        self.queue.add(key);
    }
}

impl ResourceEventHandler<Deployment> for EventDispatcher {
    fn on_add(&self, obj: &Deployment) {
        self.enqueue(ResourceKind::Primary, obj, "add");
    }

    fn on_update(&self, old: &Deployment, new: &Deployment) {
        if self.resync_on_update && pod_template_labels(old) != pod_template_labels(new) {
            self.enqueue(ResourceKind::Primary, new, "update");
        }
    }

    fn on_delete(&self, obj: &Deployment) {
        self.enqueue(ResourceKind::Primary, obj, "delete");
    }
}

impl ResourceEventHandler<Service> for EventDispatcher {
    fn on_delete(&self, obj: &Service) {
        self.enqueue(ResourceKind::ServiceExposure, obj, "delete");
    }
}

impl ResourceEventHandler<Ingress> for EventDispatcher {
    fn on_delete(&self, obj: &Ingress) {
        self.enqueue(ResourceKind::IngressRoute, obj, "delete");
    }
}
