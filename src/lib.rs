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

//! service-ingress-controller - exposes every Deployment over HTTP
//!
//! For each Deployment `X` the controller keeps a Service `X-svc` selecting
//! the Deployment's pods on port 80 and an Ingress `X-ingress` routing
//! `/X-svc` to it. Deleting the Deployment removes both.
//!
//! - Watch caches and event dispatch ([`informer`], [`dispatcher`])
//! - Rate-limited, deduplicating work queue ([`queue`], [`rate_limiter`])
//! - Reconciler and worker pool ([`reconciler`], [`worker`])
//! - Configuration, feature gates and health checks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_manager;
pub mod dispatcher;
pub mod feature;
pub mod health;
pub mod informer;
pub mod queue;
pub mod rate_limiter;
pub mod reconciler;
pub mod resources;
pub mod worker;

// Re-export commonly used types
pub use client::{ApiClient, ApiError, KubeApiClient};
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerError, ExposureController};
pub use controller_context::ControllerContext;
pub use controller_manager::ControllerManager;
pub use feature::{FeatureGate, MemoryFeatureGate};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use resources::{QueueKey, ResourceKind};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default name for the controller.
pub const CONTROLLER_NAME: &str = "service-ingress-controller";
