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

//! Configuration structures for the controller.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limiter::MIN_QPS;
use crate::resources::DEFAULT_INGRESS_CLASS;

/// Main configuration for the service-ingress controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Process-wide settings.
    #[serde(default)]
    pub generic: GenericConfig,

    /// Exposure controller settings.
    #[serde(default)]
    pub exposure: ExposureControllerConfig,

    /// Requeue rate limiting.
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

impl ControllerConfig {
    /// Checks values that would make the controller unable to do any work.
    pub fn validate(&self) -> Result<(), String> {
        if self.exposure.concurrent_syncs == 0 {
            return Err("concurrentSyncs must be at least 1".to_string());
        }
        if self.exposure.ingress_class.is_empty() {
            return Err("ingressClass must not be empty".to_string());
        }
        if !self.rate_limiter.qps.is_finite() || self.rate_limiter.qps < MIN_QPS {
            return Err(format!("rateLimiter.qps must be a number of at least {MIN_QPS}"));
        }
        if self.rate_limiter.burst == 0 {
            return Err("rateLimiter.burst must be at least 1".to_string());
        }
        if self.exposure.reconcile_timeout.is_zero() {
            return Err("reconcileTimeout must be greater than zero".to_string());
        }
        if self.generic.cache_sync_timeout.is_zero() {
            return Err("cacheSyncTimeout must be greater than zero".to_string());
        }
        if self.rate_limiter.base_delay > self.rate_limiter.max_delay {
            return Err("rateLimiter.baseDelay must not exceed rateLimiter.maxDelay".to_string());
        }
        Ok(())
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Namespace the controller itself runs in. Never reconciled.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Additional namespaces that are never reconciled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,

    /// Feature gates, as "Feature1=true,Feature2=false".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub feature_gates: String,

    /// The address to serve health checks on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port for the health check server.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,

    /// How long to wait for the informer caches to sync at startup.
    #[serde(default = "default_cache_sync_timeout", with = "humantime_serde")]
    pub cache_sync_timeout: Duration,

    /// The duration between each worker starting.
    #[serde(default = "default_worker_start_interval", with = "humantime_serde")]
    pub worker_start_interval: Duration,

    /// The maximum time to wait for workers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            namespace: default_namespace(),
            excluded_namespaces: Vec::new(),
            feature_gates: String::new(),
            bind_address: default_bind_address(),
            healthz_bind_port: default_healthz_port(),
            cache_sync_timeout: default_cache_sync_timeout(),
            worker_start_interval: default_worker_start_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_namespace() -> String {
    "service-ingress-system".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10257
}

fn default_cache_sync_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_worker_start_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Exposure controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureControllerConfig {
    /// Number of reconcile workers.
    #[serde(default = "default_concurrent_syncs")]
    pub concurrent_syncs: usize,

    /// Ingress class set on generated Ingresses.
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Requeues of a failing key before it is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on a single reconcile.
    #[serde(default = "default_reconcile_timeout", with = "humantime_serde")]
    pub reconcile_timeout: Duration,
}

impl Default for ExposureControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_syncs: default_concurrent_syncs(),
            ingress_class: default_ingress_class(),
            max_retries: default_max_retries(),
            reconcile_timeout: default_reconcile_timeout(),
        }
    }
}

fn default_concurrent_syncs() -> usize {
    3
}

fn default_ingress_class() -> String {
    DEFAULT_INGRESS_CLASS.to_string()
}

fn default_max_retries() -> u32 {
    10
}

fn default_reconcile_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Requeue rate limiting: per-key exponential backoff combined with an
/// overall token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Delay after the first failure of a key.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Cap on the per-key delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Overall requeues per second.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Overall requeue burst.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1000)
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s)
            .map_err(serde::de::Error::custom)
    }
}
