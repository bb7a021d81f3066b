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

//! The Service to Ingress controller.
//!
//! Events flow informer -> dispatcher -> per-identity worker -> classifier.
//! Every Service identity hashes to exactly one worker, so events for the
//! same Service are handled in delivery order while different Services
//! proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::Api;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;

use crate::annotation::AUTO_INGRESS_ANNOTATION;
use crate::classifier::EventClassifier;
use crate::config::AutoIngressControllerConfig;
use crate::controller::{CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::informer::{ServiceEvent, ServiceInformer, ServiceKey, SyncHandle};
use crate::reconciler::IngressReconciler;
use crate::store::{IngressStore, KubeIngressStore};

/// Name the controller registers under.
pub const CONTROLLER_NAME: &str = "tailscale-autoingress";

const EVENT_BUFFER: usize = 256;
const SHARD_BUFFER: usize = 64;

/// Returns the worker index responsible for a Service.
///
/// Events without a usable identity all go to worker 0, where the
/// classifier drops them.
pub fn shard_for(key: Option<&ServiceKey>, workers: usize) -> usize {
    let workers = workers.max(1);
    match key {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % workers as u64) as usize
        }
        None => 0,
    }
}

/// Feeds events from `events` into `workers` sharded workers until the
/// channel closes or `cancel` fires.
///
/// After cancellation no new event is started; events already being handled
/// run to completion. Events still queued are dropped and will be
/// redelivered by the next list after restart.
pub async fn dispatch<S: IngressStore>(
    classifier: Arc<EventClassifier<S>>,
    mut events: mpsc::Receiver<ServiceEvent>,
    workers: usize,
    cancel: CancellationToken,
) {
    let workers = workers.max(1);
    let mut shards = Vec::with_capacity(workers);
    let mut join_set = JoinSet::new();

    for id in 0..workers {
        let (tx, rx) = mpsc::channel(SHARD_BUFFER);
        shards.push(tx);
        join_set.spawn(run_worker(id, classifier.clone(), rx, cancel.clone()));
    }

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let shard = shard_for(event.key().as_ref(), workers);
        if shards[shard].send(event).await.is_err() {
            // Only happens when the worker stopped on cancellation.
            break;
        }
    }

    drop(shards);

    while let Some(result) = join_set.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "service worker failed");
        }
    }
}

async fn run_worker<S: IngressStore>(
    id: usize,
    classifier: Arc<EventClassifier<S>>,
    mut events: mpsc::Receiver<ServiceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        classifier.handle(event).await;
    }
    tracing::debug!(worker = id, "service worker stopped");
}

/// Keeps a `<service>-ingress` Ingress in line with each Service's
/// auto-ingress annotation.
pub struct AutoIngressController {
    workers: usize,
    sync: RwLock<Option<SyncHandle>>,
}

impl AutoIngressController {
    /// Creates the controller.
    pub fn new(config: &AutoIngressControllerConfig) -> Self {
        Self {
            workers: config.concurrent_service_syncs,
            sync: RwLock::new(None),
        }
    }

    /// Makes readiness follow the informer of the current run.
    async fn track(&self, sync: SyncHandle) {
        if self.sync.write().await.replace(sync).is_some() {
            tracing::warn!(controller = CONTROLLER_NAME, "controller restarted, readiness reset");
        }
    }
}

#[async_trait]
impl Controller for AutoIngressController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let workers = self.workers;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig {
                name: CONTROLLER_NAME.to_string(),
                reason: "concurrentServiceSyncs must be at least 1".to_string(),
            });
        }

        let services: Api<Service> = match &ctx.config.generic.namespace {
            Some(namespace) => Api::namespaced(ctx.client.clone(), namespace),
            None => Api::all(ctx.client.clone()),
        };

        let informer = ServiceInformer::new(services, ctx.resync_period_fn.clone());
        let sync = informer.sync_handle();
        self.track(sync.clone()).await;

        let store = Arc::new(KubeIngressStore::new(ctx.client.clone()));
        let classifier = Arc::new(EventClassifier::new(IngressReconciler::new(store)));

        tracing::info!(
            annotation = AUTO_INGRESS_ANNOTATION,
            namespace = ctx.config.generic.namespace.as_deref().unwrap_or("*"),
            workers,
            "watching for services"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let informer_task = tokio::spawn(informer.run(tx, cancel.clone()));
        let dispatch_task = tokio::spawn(dispatch(classifier, rx, workers, cancel.clone()));

        if sync.wait_for_cache_sync(&cancel).await {
            tracing::info!("initial service list delivered");
        }

        let (informer_result, dispatch_result) = tokio::join!(informer_task, dispatch_task);

        if let Err(e) = dispatch_result {
            return Err(ControllerError::Runtime {
                name: CONTROLLER_NAME.to_string(),
                source: e.into(),
            });
        }

        match informer_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ControllerError::Runtime {
                name: CONTROLLER_NAME.to_string(),
                source: e.into(),
            }),
            Err(e) => Err(ControllerError::Runtime {
                name: CONTROLLER_NAME.to_string(),
                source: e.into(),
            }),
        }
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            self.sync
                .read()
                .await
                .as_ref()
                .is_some_and(SyncHandle::has_synced)
        })
    }

    fn worker_count(&self) -> usize {
        self.workers
    }
}

#[cfg(test)]
mod tests {
    use kube::runtime::watcher;

    use super::*;
    use crate::informer::ServiceCache;

    #[test]
    fn test_shard_is_stable_and_in_range() {
        let key = ServiceKey::new("default", "s1");
        let first = shard_for(Some(&key), 5);
        for _ in 0..10 {
            assert_eq!(shard_for(Some(&key), 5), first);
        }
        assert!(first < 5);
        assert_eq!(shard_for(None, 5), 0);
        assert_eq!(shard_for(Some(&key), 0), 0);
    }

    #[tokio::test]
    async fn test_not_ready_before_running() {
        let controller = AutoIngressController::new(&AutoIngressControllerConfig::default());
        assert_eq!(controller.name(), CONTROLLER_NAME);
        assert_eq!(controller.worker_count(), 5);
        assert!(!controller.health_check().await);
    }

    #[tokio::test]
    async fn test_readiness_follows_latest_run() {
        let controller = AutoIngressController::new(&AutoIngressControllerConfig::default());

        let mut first = ServiceCache::new();
        first.apply(watcher::Event::Init);
        first.apply(watcher::Event::InitDone);
        controller.track(SyncHandle::new(first.store())).await;
        assert!(controller.health_check().await);

        let mut second = ServiceCache::new();
        controller.track(SyncHandle::new(second.store())).await;
        assert!(!controller.health_check().await);

        second.apply(watcher::Event::Init);
        second.apply(watcher::Event::InitDone);
        assert!(controller.health_check().await);
    }
}
