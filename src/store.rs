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

//! Ingress store client.
//!
//! The reconciler only talks to the cluster through [`IngressStore`]. The
//! distinction between [`StoreError::NotFound`] and every other error is
//! load-bearing: not-found is absorbed into no-op branches, everything else
//! aborts the reconcile attempt.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;

/// Errors returned by an [`IngressStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist.
    #[error("not found")]
    NotFound,

    /// The write raced with a concurrent modification or the object already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store rejected the object as malformed.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The store could not be reached or failed transiently.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => StoreError::NotFound,
                409 => StoreError::Conflict(resp.message),
                400 | 422 => StoreError::Invalid(resp.message),
                _ => StoreError::Unavailable(format!("{} ({})", resp.message, resp.code)),
            },
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Typed access to Ingress objects, scoped by namespace and name.
#[async_trait]
pub trait IngressStore: Send + Sync + 'static {
    /// Fetches an Ingress.
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress>;

    /// Creates an Ingress in the given namespace and returns the stored object.
    async fn create(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;

    /// Replaces an existing Ingress. The object's resource version, when
    /// set, must match the stored one.
    async fn replace(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;

    /// Deletes an Ingress.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`IngressStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeIngressStore {
    client: Client,
}

impl KubeIngressStore {
    /// Creates a store using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl IngressStore for KubeIngressStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn create(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), ingress)
            .await?)
    }

    async fn replace(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        Ok(self
            .api(namespace)
            .replace(&ingress.name_any(), &PostParams::default(), ingress)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

/// Store operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// [`IngressStore::get`]
    Get,
    /// [`IngressStore::create`]
    Create,
    /// [`IngressStore::replace`]
    Replace,
    /// [`IngressStore::delete`]
    Delete,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<(String, String), Ingress>,
    next_resource_version: u64,
    writes: usize,
    failures: Vec<(Operation, StoreError)>,
    graceful_deletion: bool,
}

impl MemoryState {
    fn take_failure(&mut self, op: Operation) -> Result<()> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(idx) => Err(self.failures.remove(idx).1),
            None => Ok(()),
        }
    }

    fn bump_resource_version(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }
}

/// In-process [`IngressStore`] that mimics the API server closely enough for
/// reconciliation tests. It assigns resource versions and counts successful
/// writes. Duplicate creates and stale replaces fail with
/// [`StoreError::Conflict`]; empty TLS hosts fail with [`StoreError::Invalid`].
#[derive(Default)]
pub struct InMemoryIngressStore {
    state: Mutex<MemoryState>,
}

impl InMemoryIngressStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store where deletes only mark objects as terminating, as
    /// the API server does for objects carrying finalizers. Call
    /// [`finalize`](Self::finalize) to remove them.
    pub fn with_graceful_deletion() -> Self {
        let store = Self::default();
        store.lock().graceful_deletion = true;
        store
    }

    /// Removes a terminating object, as if its last finalizer was cleared.
    /// Returns false if there was no such object.
    pub fn finalize(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let terminating = state
            .objects
            .get(&key)
            .is_some_and(|ingress| ingress.metadata.deletion_timestamp.is_some());
        if terminating {
            state.objects.remove(&key);
        }
        terminating
    }

    /// Seeds an object without counting it as a write.
    pub fn insert(&self, ingress: Ingress) {
        let mut state = self.lock();
        let key = (ingress.namespace().unwrap_or_default(), ingress.name_any());
        let mut ingress = ingress;
        ingress.metadata.resource_version = Some(state.bump_resource_version());
        state.objects.insert(key, ingress);
    }

    /// Returns a stored object without going through the trait.
    pub fn object(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Returns the number of successful creates and deletes so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Operation, err: StoreError) {
        self.lock().failures.push((op, err));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate(ingress: &Ingress) -> Result<()> {
    let hosts = ingress
        .spec
        .iter()
        .flat_map(|spec| spec.tls.iter().flatten())
        .flat_map(|tls| tls.hosts.iter().flatten());

    for host in hosts {
        if host.is_empty() {
            return Err(StoreError::Invalid(
                "spec.tls[0].hosts[0]: Required value".to_string(),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl IngressStore for InMemoryIngressStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress> {
        let mut state = self.lock();
        state.take_failure(Operation::Get)?;
        state
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        let mut state = self.lock();
        state.take_failure(Operation::Create)?;
        validate(ingress)?;

        let key = (namespace.to_string(), ingress.name_any());
        if state.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "ingresses \"{}\" already exists",
                key.1
            )));
        }

        let mut stored = ingress.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(state.bump_resource_version());
        state.objects.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn replace(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        let mut state = self.lock();
        state.take_failure(Operation::Replace)?;
        validate(ingress)?;

        let key = (namespace.to_string(), ingress.name_any());
        let current = state.objects.get(&key).ok_or(StoreError::NotFound)?;
        if let Some(expected) = &ingress.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "the object has been modified; resource version {} is stale",
                    expected
                )));
            }
        }
        let deletion_timestamp = current.metadata.deletion_timestamp.clone();

        let mut stored = ingress.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.deletion_timestamp = deletion_timestamp;
        stored.metadata.resource_version = Some(state.bump_resource_version());
        state.objects.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Operation::Delete)?;
        let key = (namespace.to_string(), name.to_string());

        if state.graceful_deletion {
            let version = state.bump_resource_version();
            let ingress = state.objects.get_mut(&key).ok_or(StoreError::NotFound)?;
            if ingress.metadata.deletion_timestamp.is_none() {
                // Only presence is observed, the instant does not matter.
                ingress.metadata.deletion_timestamp = Some(Time(Default::default()));
                ingress.metadata.resource_version = Some(version);
            }
        } else {
            state.objects.remove(&key).ok_or(StoreError::NotFound)?;
        }
        state.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;

    use super::*;

    fn ingress(name: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_error_mapping() {
        assert_eq!(StoreError::from(api_error(404)), StoreError::NotFound);
        assert!(matches!(StoreError::from(api_error(409)), StoreError::Conflict(_)));
        assert!(matches!(StoreError::from(api_error(422)), StoreError::Invalid(_)));
        assert!(matches!(
            StoreError::from(api_error(503)),
            StoreError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_memory_store_create_get_delete() {
        let store = InMemoryIngressStore::new();

        let created = store.create("default", &ingress("a")).await.unwrap();
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(store.get("default", "a").await.unwrap(), created);

        let dup = store.create("default", &ingress("a")).await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));

        store.delete("default", "a").await.unwrap();
        assert_eq!(store.get("default", "a").await, Err(StoreError::NotFound));
        assert_eq!(store.delete("default", "a").await, Err(StoreError::NotFound));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure_is_consumed_once() {
        let store = InMemoryIngressStore::new();
        store.insert(ingress("a"));
        store.fail_next(Operation::Get, StoreError::Unavailable("down".to_string()));

        assert!(matches!(
            store.get("default", "a").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get("default", "a").await.is_ok());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_replace_checks_resource_version() {
        let store = InMemoryIngressStore::new();
        let created = store.create("default", &ingress("a")).await.unwrap();

        let replaced = store.replace("default", &created).await.unwrap();
        assert_ne!(
            replaced.metadata.resource_version,
            created.metadata.resource_version
        );

        let stale = store.replace("default", &created).await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));
        assert_eq!(
            store.replace("default", &ingress("missing")).await,
            Err(StoreError::NotFound)
        );
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_graceful_deletion_keeps_object_until_finalized() {
        let store = InMemoryIngressStore::with_graceful_deletion();
        store.create("default", &ingress("a")).await.unwrap();

        store.delete("default", "a").await.unwrap();
        let terminating = store.get("default", "a").await.unwrap();
        assert!(terminating.metadata.deletion_timestamp.is_some());

        let recreate = store.create("default", &ingress("a")).await;
        assert!(matches!(recreate, Err(StoreError::Conflict(_))));

        assert!(store.finalize("default", "a"));
        assert!(!store.finalize("default", "a"));
        assert_eq!(store.get("default", "a").await, Err(StoreError::NotFound));
        assert!(store.create("default", &ingress("a")).await.is_ok());
    }
}
