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

//! Core controller traits and types.
//!
//! [`ExposureController`] is the controller this crate ships: it keeps a
//! Service and an Ingress in place for every Deployment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;
use crate::health::{BoxFuture, CheckResult};
use crate::informer::wait_for_cache_sync;
use crate::queue::RateLimitingQueue;
use crate::resources::QueueKey;

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The informer caches did not finish their initial list in time.
    #[error("caches did not sync within {timeout:?}")]
    CacheSyncFailed {
        /// The configured cache sync timeout.
        timeout: Duration,
    },

    /// A controller could not be started.
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        /// Controller name.
        name: String,
        /// Cause of the failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A running controller failed.
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        /// Controller name.
        name: String,
        /// Cause of the failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The configuration cannot be used.
    #[error("invalid configuration for {name}: {reason}")]
    InvalidConfig {
        /// Component the configuration belongs to.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        ControllerError::Runtime {
            name: "unknown".to_string(),
            source: err.into(),
        }
    }
}

/// A control loop run by the [`ControllerManager`](crate::ControllerManager).
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller, used in logs and
    /// health checks.
    fn name(&self) -> &str;

    /// Runs the controller until `cancel` fires or a fatal error occurs.
    ///
    /// Returns `Ok(())` on a cancellation-driven shutdown.
    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()>;

    /// Reports whether the controller is able to make progress.
    fn health_check(&self) -> BoxFuture<'_, CheckResult> {
        Box::pin(async { CheckResult::healthy("running") })
    }

    /// Returns the number of workers this controller uses.
    fn worker_count(&self) -> usize {
        1
    }
}

/// Keeps `<name>-svc` and `<name>-ingress` in sync with each Deployment.
///
/// # Lifecycle
///
/// 1. [`ExposureController::new`] registers the event dispatcher with the
///    informers.
/// 2. Workers wait for every cache to finish its initial list. Not syncing
///    within `cacheSyncTimeout` is fatal.
/// 3. Workers drain the queue until cancellation, which also shuts the
///    queue down.
pub struct ExposureController {
    queue: Arc<RateLimitingQueue<QueueKey>>,
    workers: usize,
}

impl ExposureController {
    /// Controller name.
    pub const NAME: &'static str = "service-ingress";

    /// Creates the controller and registers its event handlers.
    ///
    /// Must be called before the informers start, or their initial list is
    /// not enqueued.
    pub fn new(ctx: &ControllerContext) -> Self {
        Arc::new(ctx.dispatcher()).register(&ctx.informers);
        Self {
            queue: ctx.queue.clone(),
            workers: ctx.config.exposure.concurrent_syncs,
        }
    }
}

impl std::fmt::Debug for ExposureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureController")
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .finish()
    }
}

#[async_trait]
impl Controller for ExposureController {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let timeout = ctx.config.generic.cache_sync_timeout;
        tracing::info!(controller = Self::NAME, "waiting for caches to sync");
        if !wait_for_cache_sync(&cancel, timeout, &ctx.informers.sync_statuses()).await {
            if cancel.is_cancelled() {
                tracing::info!(controller = Self::NAME, "cancelled before caches synced");
                self.queue.shut_down();
                return Ok(());
            }
            return Err(ControllerError::CacheSyncFailed { timeout });
        }
        tracing::info!(controller = Self::NAME, "caches synced");

        let reconciler = Arc::new(ctx.reconciler());
        let pool = ctx.worker_pool();
        let queue = self.queue.clone();

        tokio::join!(pool.run(queue.clone(), reconciler, cancel.clone()), async {
            cancel.cancelled().await;
            queue.shut_down();
        });

        Ok(())
    }

    fn health_check(&self) -> BoxFuture<'_, CheckResult> {
        let result = if self.queue.is_shutting_down() {
            CheckResult::unhealthy("queue shut down")
        } else {
            CheckResult::healthy(format!(
                "{} keys queued, {} workers",
                self.queue.len(),
                self.workers
            ))
        };
        Box::pin(async move { result })
    }

    fn worker_count(&self) -> usize {
        self.workers
    }
}
