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

//! Controller context - everything a controller needs, built once at startup.

use std::sync::Arc;

use crate::client::ApiClient;
use crate::config::ControllerConfig;
use crate::dispatcher::EventDispatcher;
use crate::feature::{FeatureGate, OVERWRITE_DRIFTED_DEPENDENTS, PRIMARY_UPDATE_RESYNC};
use crate::informer::InformerFactory;
use crate::queue::RateLimitingQueue;
use crate::reconciler::Reconciler;
use crate::resources::{NamespaceExclusionSet, QueueKey};
use crate::worker::{WorkerPool, WorkerSettings};

/// Name of the reconcile queue.
pub const QUEUE_NAME: &str = "service-ingress";

/// Shared context for the controller.
///
/// Holds the API client, the watch caches, the reconcile queue and the
/// configuration. Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct ControllerContext {
    /// Configuration for this instance.
    pub config: Arc<ControllerConfig>,

    /// Authoritative access to the apiserver.
    pub api: Arc<dyn ApiClient>,

    /// Watch caches for Deployments, Services and Ingresses.
    pub informers: InformerFactory,

    /// The reconcile queue fed by the dispatcher and drained by workers.
    pub queue: Arc<RateLimitingQueue<QueueKey>>,

    /// Feature gates.
    pub feature_gate: Arc<dyn FeatureGate>,

    /// Namespaces that are never reconciled.
    pub excluded: NamespaceExclusionSet,
}

impl ControllerContext {
    /// Creates a context with a fresh queue.
    pub fn new(
        config: Arc<ControllerConfig>,
        api: Arc<dyn ApiClient>,
        informers: InformerFactory,
        feature_gate: Arc<dyn FeatureGate>,
    ) -> Self {
        let queue = Arc::new(RateLimitingQueue::with_config(
            QUEUE_NAME,
            &config.rate_limiter,
        ));
        let excluded = NamespaceExclusionSet::new(
            &config.generic.namespace,
            config.generic.excluded_namespaces.iter().cloned(),
        );

        Self {
            config,
            api,
            informers,
            queue,
            feature_gate,
            excluded,
        }
    }

    /// Builds the reconciler.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.api.clone(),
            self.informers.deployments.clone(),
            self.excluded.clone(),
            self.config.exposure.ingress_class.clone(),
        )
        .with_drift_overwrite(self.feature_gate.enabled(OVERWRITE_DRIFTED_DEPENDENTS))
    }

    /// Builds the event dispatcher feeding this context's queue.
    pub fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher::new(self.queue.clone())
            .with_resync_on_update(self.feature_gate.enabled(PRIMARY_UPDATE_RESYNC))
    }

    /// Builds the worker pool.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.config.exposure.concurrent_syncs,
            WorkerSettings::from(&self.config.exposure),
        )
        .with_start_interval(self.config.generic.worker_start_interval)
    }
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("config", &self.config)
            .field("informers", &self.informers)
            .field("queue", &self.queue)
            .field("excluded", &self.excluded)
            .finish()
    }
}
