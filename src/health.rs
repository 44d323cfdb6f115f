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

//! Readiness reporting.
//!
//! `/healthz` answers as long as the process serves HTTP. `/healthz/ready`
//! and `/healthz/deep` run the registered checks: the informer caches have
//! synced, and the controller's queue still accepts work. The deep
//! endpoint returns each check with a short detail as JSON.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::StatusCode as HttpStatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::controller::Controller;
use crate::informer::InformerFactory;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// Whether the check passed.
    pub status: HealthStatus,
    /// What the check observed, e.g. which caches are still listing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    /// A passing check.
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: Some(detail.into()),
        }
    }

    /// A failing check.
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }

    /// Returns true if the check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Aggregated readiness of every registered check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Healthy only if every check is.
    pub status: HealthStatus,

    /// Results by check name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckResult>,
}

impl HealthReport {
    /// Summarizes failing checks as `name (detail)` pairs.
    pub fn failures(&self) -> String {
        self.checks
            .iter()
            .filter(|(_, result)| !result.is_healthy())
            .map(|(name, result)| match &result.detail {
                Some(detail) => format!("{name} ({detail})"),
                None => name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A readiness check.
pub trait HealthChecker: Send + Sync + 'static {
    /// Runs the check.
    fn check(&self) -> BoxFuture<'_, CheckResult>;

    /// Returns the name the result is reported under.
    fn name(&self) -> &str;
}

/// Passes once every informer finished its initial list.
pub struct CacheSyncChecker {
    informers: InformerFactory,
}

impl CacheSyncChecker {
    /// Checks the caches of `informers`.
    pub fn new(informers: InformerFactory) -> Self {
        Self { informers }
    }
}

impl HealthChecker for CacheSyncChecker {
    fn check(&self) -> BoxFuture<'_, CheckResult> {
        let pending = self.informers.unsynced();
        Box::pin(async move {
            if pending.is_empty() {
                CheckResult::healthy("all caches synced")
            } else {
                CheckResult::unhealthy(format!("waiting for {}", pending.join(", ")))
            }
        })
    }

    fn name(&self) -> &str {
        "informers"
    }
}

/// Reports a controller's own [`Controller::health_check`].
pub struct ControllerHealthChecker {
    name: String,
    controller: Arc<dyn Controller>,
}

impl ControllerHealthChecker {
    /// Wraps `controller`; the check is named `controller:<name>`.
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self {
            name: format!("controller:{}", controller.name()),
            controller,
        }
    }
}

impl HealthChecker for ControllerHealthChecker {
    fn check(&self) -> BoxFuture<'_, CheckResult> {
        self.controller.health_check()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shared set of checks served by [`HealthServer`].
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a check.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Runs every check. An empty registry is healthy.
    pub async fn check_all(&self) -> HealthReport {
        let checkers = self.checkers.read().await.clone();
        let mut checks = BTreeMap::new();
        for checker in &checkers {
            checks.insert(checker.name().to_string(), checker.check().await);
        }

        let status = if checks.values().all(CheckResult::is_healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        HealthReport { status, checks }
    }

    /// Returns the number of registered checks.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if no check is registered.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Health check server.
///
/// Serves HTTP endpoints for health checks.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a health server with an empty registry.
    pub fn new(bind_address: String, bind_port: u16) -> Self {
        Self::with_registry(bind_address, bind_port, HealthRegistry::new())
    }

    /// Creates a health server serving an existing registry.
    pub fn with_registry(bind_address: String, bind_port: u16, registry: HealthRegistry) -> Self {
        Self {
            registry,
            bind_address,
            bind_port,
        }
    }

    /// Returns the health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Runs the health server.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!(%addr, "health server listening");

        let registry = self.registry.clone();

        loop {
            let (stream, _) = listener.accept().await?;
            let registry = registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    handle_request(req, registry.clone())
                });

                if let Err(e) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %e, "health connection closed with error");
                }
            });
        }
    }

    /// Runs the health server in a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

/// Handle incoming HTTP requests.
async fn handle_request(
    req: Request<Incoming>,
    registry: HealthRegistry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &registry).await)
}

async fn route(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" => respond(HttpStatusCode::OK, "text/plain", "ok".into()),
        "/healthz/ready" => {
            let report = registry.check_all().await;
            if report.status == HealthStatus::Healthy {
                respond(HttpStatusCode::OK, "text/plain", "ok".into())
            } else {
                let body = format!("not ready: {}", report.failures());
                respond(HttpStatusCode::SERVICE_UNAVAILABLE, "text/plain", body.into())
            }
        }
        "/healthz/deep" => {
            let report = registry.check_all().await;
            let status = if report.status == HealthStatus::Healthy {
                HttpStatusCode::OK
            } else {
                HttpStatusCode::SERVICE_UNAVAILABLE
            };
            let json = serde_json::to_string(&report).unwrap_or_default();
            respond(status, "application/json", json.into())
        }
        _ => respond(HttpStatusCode::NOT_FOUND, "text/plain", "not found".into()),
    }
}

fn respond(status: HttpStatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
