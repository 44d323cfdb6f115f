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

//! Feature gates.
//!
//! Behavior that departs from the plain add/delete reconciliation loop is
//! opt-in through a gate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Enqueue Deployments whose pod-template labels changed, so the Service
/// selector follows the pods.
pub const PRIMARY_UPDATE_RESYNC: &str = "PrimaryUpdateResync";

/// Replace an existing Service or Ingress whose spec drifted from the
/// desired one instead of accepting it as is.
pub const OVERWRITE_DRIFTED_DEPENDENTS: &str = "OverwriteDriftedDependents";

/// Error type for feature gate operations.
#[derive(Debug, thiserror::Error)]
pub enum FeatureGateError {
    /// No gate with this name exists.
    #[error("unknown feature gate: {0}")]
    UnknownFeature(String),

    /// The gate is locked to its current value.
    #[error("feature gate {0} is locked and cannot be modified")]
    Locked(String),

    /// The value is not a boolean.
    #[error("invalid value for feature gate {0}: expected bool, got {1}")]
    InvalidValue(String, String),
}

/// Result type for feature gate operations.
pub type Result<T> = std::result::Result<T, FeatureGateError>;

/// A trait for types that can check and manipulate feature gates.
pub trait FeatureGate: Send + Sync {
    /// Returns true if the given feature gate is enabled.
    fn enabled(&self, feature: &str) -> bool;

    /// Sets a feature gate to the given value.
    ///
    /// Returns an error if the feature gate doesn't exist or is locked.
    fn set(&self, feature: &str, enabled: bool) -> Result<()>;

    /// Returns all known feature gates and their current values.
    fn all_features(&self) -> HashMap<String, bool>;
}

#[derive(Debug, Clone, Copy)]
struct FeatureState {
    enabled: bool,
    locked: bool,
}

/// In-memory feature gate.
#[derive(Debug, Clone)]
pub struct MemoryFeatureGate {
    features: Arc<RwLock<HashMap<String, FeatureState>>>,
}

impl Default for MemoryFeatureGate {
    fn default() -> Self {
        Self::new(default_features().iter().copied())
    }
}

impl MemoryFeatureGate {
    /// Creates a feature gate from `(name, default_enabled, locked)`
    /// triples.
    pub fn new(features: impl IntoIterator<Item = (&'static str, bool, bool)>) -> Self {
        let features = features
            .into_iter()
            .map(|(name, enabled, locked)| (name.to_string(), FeatureState { enabled, locked }))
            .collect();

        Self {
            features: Arc::new(RwLock::new(features)),
        }
    }

    /// Sets feature gates from a comma-separated list.
    ///
    /// Format: "Feature1=true,Feature2=false"
    pub fn set_from_string(&self, s: &str) -> Result<()> {
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (name, value) = part.split_once('=').ok_or_else(|| {
                FeatureGateError::InvalidValue(part.to_string(), "missing =".to_string())
            })?;

            let enabled = value
                .trim()
                .parse::<bool>()
                .map_err(|_| FeatureGateError::InvalidValue(name.to_string(), value.to_string()))?;

            self.set(name.trim(), enabled)?;
        }
        Ok(())
    }
}

impl FeatureGate for MemoryFeatureGate {
    fn enabled(&self, feature: &str) -> bool {
        let features = self
            .features
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        features.get(feature).map(|f| f.enabled).unwrap_or(false)
    }

    fn set(&self, feature: &str, enabled: bool) -> Result<()> {
        let mut features = self
            .features
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = features
            .get_mut(feature)
            .ok_or_else(|| FeatureGateError::UnknownFeature(feature.to_string()))?;

        if state.locked {
            return Err(FeatureGateError::Locked(feature.to_string()));
        }
        state.enabled = enabled;
        Ok(())
    }

    fn all_features(&self) -> HashMap<String, bool> {
        let features = self
            .features
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        features
            .iter()
            .map(|(k, v)| (k.clone(), v.enabled))
            .collect()
    }
}

/// Known feature gates as `(name, default_enabled, locked)`.
pub fn default_features() -> &'static [(&'static str, bool, bool)] {
    &[
        (PRIMARY_UPDATE_RESYNC, false, false),
        (OVERWRITE_DRIFTED_DEPENDENTS, false, false),
    ]
}
