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

//! Service informer.
//!
//! Turns the raw `kube` watch stream into add/update/delete notifications
//! with old and new snapshots, the way a shared informer does:
//!
//! - a reflector store remembers the last seen object per identity so
//!   updates carry the previous state
//! - objects that disappear across a relist are delivered as tombstones,
//!   since the delete itself was never observed
//! - after the initial list, every cached object is redelivered as an
//!   unchanged update once per resync period

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identity of a Service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    /// Namespace of the Service.
    pub namespace: String,
    /// Name of the Service.
    pub name: String,
}

impl ServiceKey {
    /// Creates a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the key of a Service, or `None` if it lacks a name or namespace.
    pub fn from_service(service: &Service) -> Option<Self> {
        let name = service.metadata.name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = service.namespace().filter(|ns| !ns.is_empty())?;
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Wrapper delivered when a Service vanished without its delete being observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    /// Identity of the vanished Service.
    pub key: ServiceKey,
    /// Last state seen before it vanished, if known.
    pub last_known: Option<Service>,
}

/// Payload of a delete notification.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletedService {
    /// The final state of the object.
    Object(Service),
    /// The final state is unknown.
    Tombstone(Tombstone),
}

/// A change notification for a Service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// A Service was seen for the first time.
    Added(Service),
    /// A known Service changed, or was redelivered by a resync.
    Updated {
        /// Previously seen state.
        old: Service,
        /// Current state.
        new: Service,
    },
    /// A Service was deleted.
    Deleted(DeletedService),
}

impl ServiceEvent {
    /// Short name of the event kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::Added(_) => "added",
            ServiceEvent::Updated { .. } => "updated",
            ServiceEvent::Deleted(_) => "deleted",
        }
    }

    /// Returns the identity this event concerns, if it can be determined.
    pub fn key(&self) -> Option<ServiceKey> {
        match self {
            ServiceEvent::Added(service) | ServiceEvent::Updated { new: service, .. } => {
                ServiceKey::from_service(service)
            }
            ServiceEvent::Deleted(DeletedService::Object(service)) => {
                ServiceKey::from_service(service)
            }
            ServiceEvent::Deleted(DeletedService::Tombstone(tombstone)) => {
                Some(tombstone.key.clone())
            }
        }
    }
}

/// Local cache of watched Services, backed by a reflector store.
///
/// Converts watcher events into [`ServiceEvent`]s. Kept separate from the
/// network loop so relist and resync semantics can be tested directly.
pub struct ServiceCache {
    writer: Writer<Service>,
    store: Store<Service>,
    relist: Option<HashSet<ObjectRef<Service>>>,
}

impl Default for ServiceCache {
    fn default() -> Self {
        let (store, writer) = reflector::store();
        Self {
            writer,
            store,
            relist: None,
        }
    }
}

impl ServiceCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a reader over the cached Services.
    pub fn store(&self) -> Store<Service> {
        self.store.clone()
    }

    /// Returns true once the first full list has completed.
    pub fn has_synced(&self) -> bool {
        is_ready(&self.store)
    }

    /// Returns the number of cached Services.
    pub fn len(&self) -> usize {
        self.store.state().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.store.state().is_empty()
    }

    /// Applies a watcher event and returns the notifications it produces.
    ///
    /// Notifications are computed against the store before the event is
    /// written, so during a relist they compare with the pre-relist state.
    pub fn apply(&mut self, event: watcher::Event<Service>) -> Vec<ServiceEvent> {
        let events = match &event {
            watcher::Event::Apply(service) => vec![self.change(service)],
            watcher::Event::Delete(service) => {
                vec![ServiceEvent::Deleted(DeletedService::Object(service.clone()))]
            }
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(service) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(ObjectRef::from_obj(service));
                }
                vec![self.change(service)]
            }
            watcher::Event::InitDone => self.vanished(),
        };
        self.writer.apply_watcher_event(&event);
        events
    }

    /// Redelivers every cached Service as an unchanged update.
    pub fn resync(&self) -> Vec<ServiceEvent> {
        self.store
            .state()
            .into_iter()
            .map(|service| {
                let service = service.as_ref().clone();
                ServiceEvent::Updated {
                    old: service.clone(),
                    new: service,
                }
            })
            .collect()
    }

    fn change(&self, service: &Service) -> ServiceEvent {
        if ServiceKey::from_service(service).is_none() {
            // Unusable identity; the classifier drops it.
            return ServiceEvent::Added(service.clone());
        }
        match self.store.get(&ObjectRef::from_obj(service)) {
            Some(old) => ServiceEvent::Updated {
                old: old.as_ref().clone(),
                new: service.clone(),
            },
            None => ServiceEvent::Added(service.clone()),
        }
    }

    /// Tombstones for cached Services missing from the relist that just ended.
    fn vanished(&mut self) -> Vec<ServiceEvent> {
        let seen = self.relist.take().unwrap_or_default();
        let mut tombstones: Vec<Tombstone> = self
            .store
            .state()
            .into_iter()
            .filter(|service| !seen.contains(&ObjectRef::from_obj(service.as_ref())))
            .filter_map(|service| {
                let key = ServiceKey::from_service(&service)?;
                Some(Tombstone {
                    key,
                    last_known: Some(service.as_ref().clone()),
                })
            })
            .collect();
        tombstones.sort_by(|a, b| a.key.cmp(&b.key));

        tombstones
            .into_iter()
            .map(|tombstone| ServiceEvent::Deleted(DeletedService::Tombstone(tombstone)))
            .collect()
    }
}

fn is_ready(store: &Store<Service>) -> bool {
    matches!(store.wait_until_ready().now_or_never(), Some(Ok(())))
}

/// Observes whether an informer has delivered its initial list.
#[derive(Clone)]
pub struct SyncHandle {
    store: Store<Service>,
}

impl SyncHandle {
    pub(crate) fn new(store: Store<Service>) -> Self {
        Self { store }
    }

    /// Returns true once the initial list has been delivered.
    pub fn has_synced(&self) -> bool {
        is_ready(&self.store)
    }

    /// Waits until the initial list has been delivered.
    ///
    /// Returns false if `cancel` fires first or the informer goes away.
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            ready = self.store.wait_until_ready() => ready.is_ok(),
        }
    }
}

/// Watches Services and emits [`ServiceEvent`]s.
pub struct ServiceInformer {
    api: Api<Service>,
    watcher_config: watcher::Config,
    resync_period_fn: Arc<dyn Fn() -> Duration + Send + Sync>,
    cache: ServiceCache,
}

impl ServiceInformer {
    /// Creates an informer over the given API scope.
    pub fn new(api: Api<Service>, resync_period_fn: Arc<dyn Fn() -> Duration + Send + Sync>) -> Self {
        Self {
            api,
            watcher_config: watcher::Config::default(),
            resync_period_fn,
            cache: ServiceCache::new(),
        }
    }

    /// Returns a handle that reports when the initial list completed.
    pub fn sync_handle(&self) -> SyncHandle {
        SyncHandle::new(self.cache.store())
    }

    /// Runs the watch loop, sending notifications to `events` until
    /// `cancel` fires or the receiver is dropped.
    ///
    /// Watch errors are retried with backoff. The loop only fails if the
    /// watch stream itself terminates.
    pub async fn run(
        self,
        events: mpsc::Sender<ServiceEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let Self {
            api,
            watcher_config,
            resync_period_fn,
            mut cache,
        } = self;

        let stream = watcher::watcher(api, watcher_config).default_backoff();
        let mut stream = std::pin::pin!(stream);

        let resync = tokio::time::sleep(resync_period_fn());
        tokio::pin!(resync);
        let mut announced = false;

        tracing::info!("starting service informer");

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("service informer stopping");
                    return Ok(());
                }
                _ = &mut resync => {
                    let next = resync_period_fn();
                    resync.as_mut().reset(tokio::time::Instant::now() + next);
                    if !cache.has_synced() {
                        continue;
                    }
                    tracing::debug!(services = cache.len(), next = ?next, "resyncing services");
                    cache.resync()
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let batch = cache.apply(event);
                        if !announced && cache.has_synced() {
                            tracing::info!(services = cache.len(), "service cache synced");
                            announced = true;
                        }
                        batch
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "service watch failed, retrying");
                        continue;
                    }
                    None => anyhow::bail!("service watch stream ended"),
                }
            };

            for event in batch {
                if events.send(event).await.is_err() {
                    tracing::debug!("event receiver closed, stopping service informer");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    fn service(namespace: &str, name: &str, version: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_distinguishes_add_and_update() {
        let mut cache = ServiceCache::new();

        let added = cache.apply(watcher::Event::Apply(service("default", "a", "1")));
        assert_eq!(added, vec![ServiceEvent::Added(service("default", "a", "1"))]);

        let updated = cache.apply(watcher::Event::Apply(service("default", "a", "2")));
        assert_eq!(
            updated,
            vec![ServiceEvent::Updated {
                old: service("default", "a", "1"),
                new: service("default", "a", "2"),
            }]
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_delete_evicts_and_delivers_object() {
        let mut cache = ServiceCache::new();
        cache.apply(watcher::Event::Apply(service("default", "a", "1")));

        let deleted = cache.apply(watcher::Event::Delete(service("default", "a", "2")));
        assert_eq!(
            deleted,
            vec![ServiceEvent::Deleted(DeletedService::Object(service(
                "default", "a", "2"
            )))]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_initial_list_marks_synced() {
        let mut cache = ServiceCache::new();
        assert!(!cache.has_synced());

        cache.apply(watcher::Event::Init);
        let events = cache.apply(watcher::Event::InitApply(service("default", "a", "1")));
        assert!(matches!(events[0], ServiceEvent::Added(_)));
        assert!(!cache.has_synced());

        assert!(cache.apply(watcher::Event::InitDone).is_empty());
        assert!(cache.has_synced());
    }

    #[test]
    fn test_relist_emits_tombstones_for_missed_deletes() {
        let mut cache = ServiceCache::new();
        cache.apply(watcher::Event::Init);
        cache.apply(watcher::Event::InitApply(service("default", "a", "1")));
        cache.apply(watcher::Event::InitApply(service("default", "b", "1")));
        cache.apply(watcher::Event::InitDone);

        cache.apply(watcher::Event::Init);
        let relisted = cache.apply(watcher::Event::InitApply(service("default", "a", "1")));
        assert!(matches!(relisted[0], ServiceEvent::Updated { .. }));
        let done = cache.apply(watcher::Event::InitDone);

        assert_eq!(
            done,
            vec![ServiceEvent::Deleted(DeletedService::Tombstone(Tombstone {
                key: ServiceKey::new("default", "b"),
                last_known: Some(service("default", "b", "1")),
            }))]
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_resync_redelivers_unchanged_objects() {
        let mut cache = ServiceCache::new();
        cache.apply(watcher::Event::Apply(service("default", "a", "1")));
        cache.apply(watcher::Event::Apply(service("other", "b", "7")));

        let events = cache.resync();
        assert_eq!(events.len(), 2);
        for event in events {
            match event {
                ServiceEvent::Updated { old, new } => assert_eq!(old, new),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_event_key() {
        let tombstone = ServiceEvent::Deleted(DeletedService::Tombstone(Tombstone {
            key: ServiceKey::new("ns", "gone"),
            last_known: None,
        }));
        assert_eq!(tombstone.key(), Some(ServiceKey::new("ns", "gone")));

        let mut nameless = service("default", "a", "1");
        nameless.metadata.name = None;
        assert_eq!(ServiceEvent::Added(nameless).key(), None);
        assert_eq!(ServiceKey::new("ns", "a").to_string(), "ns/a");
    }

    #[tokio::test]
    async fn test_sync_handle_waits_and_cancels() {
        let mut cache = ServiceCache::new();
        let handle = SyncHandle::new(cache.store());
        assert!(!handle.has_synced());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!handle.wait_for_cache_sync(&cancel).await);

        cache.apply(watcher::Event::Init);
        cache.apply(watcher::Event::InitDone);
        assert!(handle.wait_for_cache_sync(&CancellationToken::new()).await);
        assert!(handle.has_synced());
    }

    #[test]
    fn test_relist_keeps_serving_old_state_until_done() {
        let mut cache = ServiceCache::new();
        cache.apply(watcher::Event::Apply(service("default", "a", "1")));

        cache.apply(watcher::Event::Init);
        assert_eq!(cache.len(), 1);
        let relisted = cache.apply(watcher::Event::InitApply(service("default", "c", "1")));
        assert!(matches!(relisted[0], ServiceEvent::Added(_)));
        assert_eq!(cache.len(), 1);

        let done = cache.apply(watcher::Event::InitDone);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key(), Some(ServiceKey::new("default", "a")));
        assert_eq!(cache.len(), 1);
        assert!(cache.store().get(&ObjectRef::new("c").within("default")).is_some());
    }
}
