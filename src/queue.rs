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

//! Rate-limited, deduplicating work queue.
//!
//! The queue tracks three sets of keys:
//!
//! - `queue`: keys waiting for a worker, in FIFO order
//! - `dirty`: keys that need processing (queued, or re-added while in flight)
//! - `processing`: keys currently held by a worker
//!
//! A key added while it is being processed is only marked dirty and goes
//! back to the queue when its worker calls [`RateLimitingQueue::done`], so a
//! key is never handed to two workers at the same time.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimiterConfig;
use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// A work queue with per-key deduplication and rate-limited requeues.
pub struct RateLimitingQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
    shutdown: CancellationToken,
}

impl<K> fmt::Debug for RateLimitingQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("name", &self.name)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue using the given rate limiter for requeues.
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            rate_limiter: Box::new(rate_limiter),
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a queue with the default controller rate limiter.
    pub fn with_config(name: impl Into<String>, config: &RateLimiterConfig) -> Self {
        Self::new(name, default_controller_rate_limiter(config))
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a key. Does nothing if the key is already waiting, or if the
    /// queue is shutting down.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once the queue has been shut down. The caller owns the
    /// key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as no longer being processed. If it was re-added in the
    /// meantime it goes back to the queue.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Adds `key` after `delay`. The pending add is dropped if the queue
    /// shuts down first.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Re-adds `key` once the rate limiter allows it and returns the delay
    /// that was applied.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = self.rate_limiter.when(&key);
        self.add_after(key, delay);
        delay
    }

    /// Clears the retry history of `key`.
    pub fn forget(&self, key: &K) {
        self.rate_limiter.forget(key);
    }

    /// Number of times `key` has been requeued since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Returns true if no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue: pending and future [`get`](Self::get) calls return
    /// `None` and delayed adds are dropped.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// Returns true once [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
