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

//! Watch cache: reflector-backed informers with event handlers.
//!
//! Each [`Informer`] mirrors one resource kind into a local store through
//! `kube::runtime::watcher` and calls its registered
//! [`ResourceEventHandler`]s on add, update and delete. After a relist,
//! objects missing from the new list are reported as deleted.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::{reflector, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval between `has_synced` polls while waiting for caches.
pub const CACHE_SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Callbacks invoked by an [`Informer`]. All methods default to no-ops.
pub trait ResourceEventHandler<K>: Send + Sync {
    /// An object appeared in the cache.
    fn on_add(&self, _obj: &K) {}

    /// A cached object changed.
    fn on_update(&self, _old: &K, _new: &K) {}

    /// An object left the cache.
    fn on_delete(&self, _obj: &K) {}
}

/// Reports whether a cache finished its initial list.
pub trait CacheSyncStatus: Send + Sync {
    /// Returns true once the initial list has been stored.
    fn has_synced(&self) -> bool;
}

/// Cached reads of the primary resource.
pub trait PrimaryLister: Send + Sync {
    /// Returns the cached Deployment, if the cache has it.
    fn get_primary(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>>;
}

/// A local mirror of one resource kind.
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    name: &'static str,
    reader: Store<K>,
    writer: Mutex<Option<reflector::store::Writer<K>>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<K>>>>,
    synced: AtomicBool,
}

impl<K> fmt::Debug for Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Informer")
            .field("name", &self.name)
            .field("synced", &self.synced.load(Ordering::Acquire))
            .finish()
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    /// Creates an informer with an empty store.
    pub fn new(name: &'static str) -> Self {
        let writer = reflector::store::Writer::default();
        let reader = writer.as_reader();
        Self {
            name,
            reader,
            writer: Mutex::new(Some(writer)),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }

    /// Returns the informer name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers a handler. Handlers registered after the informer started
    /// only see subsequent events.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    /// Returns a read handle on the local store.
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Returns the cached object `namespace/name`.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.reader
            .get(&ObjectRef::new(name).within(namespace))
    }

    /// Watches `api` until `cancel` fires.
    pub async fn run(self: Arc<Self>, api: Api<K>, config: watcher::Config, cancel: CancellationToken) {
        let stream = watcher::watcher(api, config).default_backoff();
        self.run_stream(stream, cancel).await;
    }

    /// Feeds watch events from `stream` into the store and the handlers
    /// until the stream ends or `cancel` fires.
    pub async fn run_stream<S, E>(self: Arc<Self>, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Event<K>, E>> + Send,
        E: fmt::Display,
    {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut writer) = writer else {
            tracing::error!(informer = %self.name, "informer already running");
            return;
        };

        tracing::info!(informer = %self.name, "starting informer");

        let mut stream = std::pin::pin!(stream);
        let mut relist: Option<HashSet<ObjectRef<K>>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(informer = %self.name, "informer stopping");
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => self.handle_event(&mut writer, event, &mut relist),
                    Some(Err(e)) => {
                        tracing::warn!(informer = %self.name, error = %e, "watch error, retrying with backoff");
                    }
                    None => {
                        tracing::warn!(informer = %self.name, "watch stream ended");
                        return;
                    }
                }
            }
        }
    }

    fn handle_event(
        &self,
        writer: &mut reflector::store::Writer<K>,
        event: Event<K>,
        relist: &mut Option<HashSet<ObjectRef<K>>>,
    ) {
        match &event {
            Event::Init => {
                *relist = Some(HashSet::new());
                writer.apply_watcher_event(&event);
            }
            Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.reader.get(&obj_ref);
                if let Some(seen) = relist.as_mut() {
                    seen.insert(obj_ref);
                }
                writer.apply_watcher_event(&event);
                self.notify_apply(old, obj);
            }
            Event::InitDone => {
                let stale: Vec<Arc<K>> = match relist.take() {
                    Some(seen) => self
                        .reader
                        .state()
                        .into_iter()
                        .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                        .collect(),
                    None => Vec::new(),
                };
                writer.apply_watcher_event(&event);
                for obj in stale {
                    self.for_each_handler(|h| h.on_delete(&obj));
                }
                if !self.synced.swap(true, Ordering::AcqRel) {
                    tracing::info!(informer = %self.name, objects = self.reader.state().len(), "cache synced");
                }
            }
            Event::Apply(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(obj));
                writer.apply_watcher_event(&event);
                self.notify_apply(old, obj);
            }
            Event::Delete(obj) => {
                writer.apply_watcher_event(&event);
                self.for_each_handler(|h| h.on_delete(obj));
            }
        }
    }

    fn notify_apply(&self, old: Option<Arc<K>>, new: &K) {
        match old {
            None => self.for_each_handler(|h| h.on_add(new)),
            Some(old) if old.resource_version() != new.resource_version() => {
                self.for_each_handler(|h| h.on_update(&old, new))
            }
            Some(_) => {}
        }
    }

    fn for_each_handler(&self, f: impl Fn(&dyn ResourceEventHandler<K>)) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for handler in &handlers {
            f(handler.as_ref());
        }
    }
}

impl<K> CacheSyncStatus for Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

impl PrimaryLister for Informer<Deployment> {
    fn get_primary(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.reader
            .get(&ObjectRef::new(name).within(namespace))
    }
}

/// The informers of every kind the controller watches.
///
/// Informers are created empty; [`start`](Self::start) spawns one watch
/// task per kind.
#[derive(Debug, Clone)]
pub struct InformerFactory {
    /// Deployments: the primary resource.
    pub deployments: Arc<Informer<Deployment>>,
    /// Services created by the controller.
    pub services: Arc<Informer<Service>>,
    /// Ingresses created by the controller.
    pub ingresses: Arc<Informer<Ingress>>,
}

impl Default for InformerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl InformerFactory {
    /// Creates the informers.
    pub fn new() -> Self {
        Self {
            deployments: Arc::new(Informer::new("deployments")),
            services: Arc::new(Informer::new("services")),
            ingresses: Arc::new(Informer::new("ingresses")),
        }
    }

    /// Starts watching every kind across all namespaces.
    pub fn start(&self, client: &Client, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let config = watcher::Config::default();
        vec![
            tokio::spawn(Arc::clone(&self.deployments).run(
                Api::all(client.clone()),
                config.clone(),
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(&self.services).run(
                Api::all(client.clone()),
                config.clone(),
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(&self.ingresses).run(
                Api::all(client.clone()),
                config,
                cancel.clone(),
            )),
        ]
    }

    /// Sync status of every informer.
    pub fn sync_statuses(&self) -> Vec<Arc<dyn CacheSyncStatus>> {
        vec![
            self.deployments.clone() as Arc<dyn CacheSyncStatus>,
            self.services.clone() as Arc<dyn CacheSyncStatus>,
            self.ingresses.clone() as Arc<dyn CacheSyncStatus>,
        ]
    }

    /// Returns true once every informer has synced.
    pub fn has_synced(&self) -> bool {
        self.sync_statuses().iter().all(|s| s.has_synced())
    }

    /// Names of the informers still waiting for their initial list.
    pub fn unsynced(&self) -> Vec<&'static str> {
        let mut pending = Vec::new();
        if !self.deployments.has_synced() {
            pending.push(self.deployments.name());
        }
        if !self.services.has_synced() {
            pending.push(self.services.name());
        }
        if !self.ingresses.has_synced() {
            pending.push(self.ingresses.name());
        }
        pending
    }
}

/// Waits until every cache has synced.
///
/// Returns `false` if `cancel` fires or `timeout` elapses first.
pub async fn wait_for_cache_sync(
    cancel: &CancellationToken,
    timeout: Duration,
    caches: &[Arc<dyn CacheSyncStatus>],
) -> bool {
    let poll = async {
        let mut interval = tokio::time::interval(CACHE_SYNC_POLL_PERIOD);
        loop {
            interval.tick().await;
            if caches.iter().all(|c| c.has_synced()) {
                return true;
            }
        }
    };

    tokio::select! {
        synced = poll => synced,
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(timeout) => false,
    }
}
