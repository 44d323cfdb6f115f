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

//! Worker pool draining the reconcile queue.
//!
//! Workers share nothing but the queue. The queue hands a key to at most
//! one worker at a time, so the reconciler needs no locking of its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExposureControllerConfig;
use crate::queue::RateLimitingQueue;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::resources::QueueKey;

/// Retry policy applied at the worker boundary.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Requeues of a failing key before it is dropped.
    pub max_retries: u32,
    /// Upper bound on a single reconcile.
    pub reconcile_timeout: Duration,
}

impl From<&ExposureControllerConfig> for WorkerSettings {
    fn from(config: &ExposureControllerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            reconcile_timeout: config.reconcile_timeout,
        }
    }
}

/// Reconciles one key and applies the retry policy to the outcome.
///
/// The key must have been returned by `queue.get()`; it is marked done
/// before returning.
pub async fn process_item(
    queue: &Arc<RateLimitingQueue<QueueKey>>,
    reconciler: &Reconciler,
    settings: &WorkerSettings,
    key: QueueKey,
) -> ReconcileOutcome {
    let outcome =
        match tokio::time::timeout(settings.reconcile_timeout, reconciler.reconcile(&key)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(%key, timeout = ?settings.reconcile_timeout, "reconcile timed out");
                ReconcileOutcome::Requeue
            }
        };

    match outcome {
        ReconcileOutcome::Handled => queue.forget(&key),
        ReconcileOutcome::Requeue => {
            let retries = queue.num_requeues(&key);
            if retries < settings.max_retries {
                let delay = queue.add_rate_limited(key.clone());
                debug!(%key, attempt = retries + 1, delay = ?delay, "requeued");
            } else {
                error!(%key, retries, "dropping key after repeated failures");
                queue.forget(&key);
            }
        }
    }

    queue.done(&key);
    outcome
}

/// Runs one worker until the queue shuts down or `cancel` fires.
///
/// A reconcile in progress is always allowed to finish.
pub async fn run_worker(
    id: usize,
    queue: Arc<RateLimitingQueue<QueueKey>>,
    reconciler: Arc<Reconciler>,
    settings: WorkerSettings,
    cancel: CancellationToken,
) {
    debug!(worker = id, queue = %queue.name(), "worker started");
    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };
        process_item(&queue, &reconciler, &settings, key).await;
    }
    debug!(worker = id, "worker stopped");
}

/// A fixed number of workers sharing one queue.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    start_interval: Duration,
    settings: WorkerSettings,
}

impl WorkerPool {
    /// Creates a pool of `workers` workers.
    pub fn new(workers: usize, settings: WorkerSettings) -> Self {
        Self {
            workers,
            start_interval: Duration::ZERO,
            settings,
        }
    }

    /// Staggers worker starts by a jittered `interval` each.
    pub fn with_start_interval(mut self, interval: Duration) -> Self {
        self.start_interval = interval;
        self
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs all workers and waits for them to exit.
    pub async fn run(
        &self,
        queue: Arc<RateLimitingQueue<QueueKey>>,
        reconciler: Arc<Reconciler>,
        cancel: CancellationToken,
    ) {
        let mut join_set = JoinSet::new();

        for id in 0..self.workers {
            let delay = jittered(self.start_interval.saturating_mul(id as u32));
            let queue = queue.clone();
            let reconciler = reconciler.clone();
            let settings = self.settings;
            let cancel = cancel.clone();

            join_set.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
                run_worker(id, queue, reconciler, settings, cancel).await;
            });
        }

        info!(workers = self.workers, "workers started");

        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "worker panicked");
                }
            }
        }
    }
}

/// Adds up to 100% random jitter to `base`.
pub fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let jitter = rand::random::<f64>();
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
}
