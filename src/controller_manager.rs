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

//! Controller manager - the main orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiClient, KubeApiClient};
use crate::config::ControllerConfig;
use crate::controller::{Controller, ControllerError, ExposureController, Result};
use crate::controller_context::ControllerContext;
use crate::feature::{FeatureGate, MemoryFeatureGate};
use crate::health::{CacheSyncChecker, ControllerHealthChecker, HealthRegistry};
use crate::informer::InformerFactory;
use crate::worker::jittered;

/// The controller manager.
///
/// Owns the informers, the shared context and the controllers, and drives
/// them from startup to graceful shutdown.
///
/// # Example
///
/// ```rust,no_run
/// use service_ingress_controller::config::ControllerConfig;
/// use service_ingress_controller::controller_manager::ControllerManager;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = kube::Client::try_default().await?;
///     let manager = ControllerManager::new(ControllerConfig::default(), client)?;
///     manager.run().await?;
///     Ok(())
/// }
/// ```
pub struct ControllerManager {
    /// Configuration for this instance.
    config: Arc<ControllerConfig>,

    /// Kubernetes client; `None` when informers are fed externally.
    client: Option<kube::Client>,

    /// Authoritative API access handed to the reconciler.
    api: Arc<dyn ApiClient>,

    /// Watch caches.
    informers: InformerFactory,

    /// Feature gate implementation.
    feature_gate: Arc<dyn FeatureGate>,

    /// Readiness checks served by the health server.
    health: HealthRegistry,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl ControllerManager {
    /// Creates a manager talking to the cluster through `client`.
    ///
    /// Fails if the configured feature gates do not parse.
    pub fn new(config: ControllerConfig, client: kube::Client) -> Result<Self> {
        let feature_gate = MemoryFeatureGate::default();
        feature_gate
            .set_from_string(&config.generic.feature_gates)
            .map_err(|e| ControllerError::InvalidConfig {
                name: "featureGates".to_string(),
                reason: e.to_string(),
            })?;

        let mut manager = Self::with_parts(
            config,
            Arc::new(KubeApiClient::new(client.clone())),
            InformerFactory::new(),
            Arc::new(feature_gate),
        );
        manager.client = Some(client);
        Ok(manager)
    }

    /// Creates a manager from pre-built parts.
    ///
    /// No watches are started; the caller feeds the informers.
    pub fn with_parts(
        config: ControllerConfig,
        api: Arc<dyn ApiClient>,
        informers: InformerFactory,
        feature_gate: Arc<dyn FeatureGate>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client: None,
            api,
            informers,
            feature_gate,
            health: HealthRegistry::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Returns the registry the readiness checks are added to.
    pub fn health_registry(&self) -> &HealthRegistry {
        &self.health
    }

    /// Returns the informers.
    pub fn informers(&self) -> &InformerFactory {
        &self.informers
    }

    /// Returns the feature gate.
    pub fn feature_gate(&self) -> &Arc<dyn FeatureGate> {
        &self.feature_gate
    }

    /// Runs the manager until shutdown.
    ///
    /// This will:
    /// 1. Build the controller context and the controller
    /// 2. Start the informers
    /// 3. Register readiness checks
    /// 4. Run the controller until the shutdown token fires or it fails
    ///
    /// A cache that does not sync in time is returned as
    /// [`ControllerError::CacheSyncFailed`].
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            namespace = %self.config.generic.namespace,
            workers = self.config.exposure.concurrent_syncs,
            ingress_class = %self.config.exposure.ingress_class,
            features = ?self.feature_gate.all_features(),
            "starting service-ingress controller"
        );

        let ctx = self.build_controller_context();
        let controllers: Vec<Arc<dyn Controller>> = vec![Arc::new(ExposureController::new(&ctx))];

        let informer_tasks = match &self.client {
            Some(client) => self.informers.start(client, &self.shutdown_token),
            None => Vec::new(),
        };

        self.register_health_checks(&controllers).await;

        let result = self.run_controllers(ctx, controllers).await;

        // Informers outlive a failed controller; stop them either way.
        self.shutdown_token.cancel();
        for task in informer_tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "informer task failed");
            }
        }

        result
    }

    /// Builds the controller context.
    fn build_controller_context(&self) -> ControllerContext {
        ControllerContext::new(
            self.config.clone(),
            self.api.clone(),
            self.informers.clone(),
            self.feature_gate.clone(),
        )
    }

    async fn register_health_checks(&self, controllers: &[Arc<dyn Controller>]) {
        self.health
            .register(Arc::new(CacheSyncChecker::new(self.informers.clone())))
            .await;
        for controller in controllers {
            self.health
                .register(Arc::new(ControllerHealthChecker::new(controller.clone())))
                .await;
        }
    }

    /// Runs all controllers concurrently.
    async fn run_controllers(
        &self,
        ctx: ControllerContext,
        controllers: Vec<Arc<dyn Controller>>,
    ) -> Result<()> {
        let start_interval = self.config.generic.worker_start_interval;

        let mut join_set = JoinSet::new();

        for controller in controllers {
            let name = controller.name().to_string();
            let ctx = ctx.clone();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();
            let delay = jittered(start_interval);

            join_set.spawn(async move {
                tokio::time::sleep(delay).await;

                tracing::info!(
                    controller = %name,
                    workers = controller.worker_count(),
                    "starting controller"
                );
                running.write().await.insert(name.clone());

                let result = controller.run(ctx, cancel).await;

                running.write().await.remove(&name);

                match &result {
                    Ok(()) => tracing::info!(controller = %name, "controller terminated successfully"),
                    Err(e) => tracing::error!(controller = %name, error = %e, "controller terminated with error"),
                }

                (name, result)
            });
        }

        tokio::select! {
            result = async {
                while let Some(result) = join_set.join_next().await {
                    match result {
                        Ok((name, Ok(()))) => {
                            tracing::debug!(controller = %name, "controller finished");
                        }
                        Ok((_, Err(e))) => return Err::<(), _>(e),
                        Err(e) => {
                            if e.is_panic() {
                                tracing::error!("controller task panicked");
                            }
                            return Err(ControllerError::Runtime {
                                name: "unknown".to_string(),
                                source: e.into(),
                            });
                        }
                    }
                }
                Ok(())
            } => {
                result?;
            }

            _ = self.shutdown_token.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        // Wait for remaining controllers with timeout
        let shutdown_timeout = self.config.generic.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                tracing::warn!(
                    controllers = ?running.iter().collect::<Vec<_>>(),
                    "shutdown timeout reached, controllers still running"
                );
                join_set.abort_all();
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(Ok((name, Ok(())))) => {
                            tracing::debug!(controller = %name, "controller stopped");
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "controller task failed");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }
}
