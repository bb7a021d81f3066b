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

//! Ingress reconciler.
//!
//! Converges the Ingress named `<service>-ingress` towards a
//! [`DesiredIngressState`]. This is the only component that writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{
    Ingress, IngressBackend, IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use kube::api::ObjectMeta;
use thiserror::Error;

use crate::annotation::{ingress_name, DesiredIngress, DesiredIngressState, INGRESS_CLASS_NAME};
use crate::store::{IngressStore, StoreError};

/// Label stamped on created Ingresses.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "tailscale-autoingress";

/// A store call failed for a reason other than not-found.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to {action} ingress {namespace}/{name}: {source}")]
pub struct ReconcileError {
    /// The store call that failed.
    pub action: &'static str,
    /// Namespace of the Ingress.
    pub namespace: String,
    /// Name of the Ingress.
    pub name: String,
    /// The underlying store error.
    #[source]
    pub source: StoreError,
}

impl ReconcileError {
    fn new(action: &'static str, namespace: &str, name: &str, source: StoreError) -> Self {
        Self {
            action,
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }
    }
}

/// Result type for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// What [`IngressReconciler::delete`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The Ingress existed and was deleted.
    Deleted,
    /// There was nothing to delete.
    AlreadyAbsent,
}

/// What [`IngressReconciler::reconcile`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No Ingress existed; one was created.
    Created(Ingress),
    /// The TLS host drifted; the Ingress was replaced in place.
    Replaced(Ingress),
    /// The existing Ingress already matches; nothing was written.
    Unchanged(Ingress),
    /// An Ingress exists but has no TLS host to compare; it was left alone.
    Unrecognized(Ingress),
    /// No Ingress is desired; the delete path ran.
    Removed(DeleteOutcome),
}

impl ReconcileOutcome {
    /// Returns the Ingress as it stands after reconciliation, if any.
    pub fn ingress(&self) -> Option<&Ingress> {
        match self {
            ReconcileOutcome::Created(ingress)
            | ReconcileOutcome::Replaced(ingress)
            | ReconcileOutcome::Unchanged(ingress)
            | ReconcileOutcome::Unrecognized(ingress) => Some(ingress),
            ReconcileOutcome::Removed(_) => None,
        }
    }
}

/// Returns the first host of the first TLS entry.
pub fn tls_host(ingress: &Ingress) -> Option<&str> {
    ingress
        .spec
        .as_ref()?
        .tls
        .as_ref()?
        .first()?
        .hosts
        .as_ref()?
        .first()
        .map(String::as_str)
}

/// Builds the Ingress object for a desired state.
pub fn build_ingress(namespace: &str, desired: &DesiredIngress) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(&desired.backend_service_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS_NAME.to_string()),
            default_backend: Some(IngressBackend {
                service: Some(IngressServiceBackend {
                    name: desired.backend_service_name.clone(),
                    port: Some(ServiceBackendPort {
                        number: Some(desired.backend_port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![desired.hostname.clone()]),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Drives Ingress objects towards their desired state.
pub struct IngressReconciler<S> {
    store: Arc<S>,
}

impl<S> Clone for IngressReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: IngressStore> IngressReconciler<S> {
    /// Creates a reconciler writing through the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Reconciles the Ingress owned by `service_name` against `desired`.
    ///
    /// Repeated calls with an unchanged desired state issue no writes. A
    /// hostname change replaces the existing object in place.
    pub async fn reconcile(
        &self,
        namespace: &str,
        service_name: &str,
        desired: &DesiredIngressState,
    ) -> Result<ReconcileOutcome> {
        let desired = match desired {
            DesiredIngressState::Present(desired) => desired,
            DesiredIngressState::Absent(_) => {
                let outcome = self.delete(namespace, service_name).await?;
                return Ok(ReconcileOutcome::Removed(outcome));
            }
        };

        let name = ingress_name(service_name);

        let existing = match self.store.get(namespace, &name).await {
            Ok(existing) => Some(existing),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(ReconcileError::new("get", namespace, &name, e)),
        };

        let Some(existing) = existing else {
            let created = self.create(namespace, &name, desired).await?;
            tracing::info!(
                namespace = %namespace,
                service = %service_name,
                ingress = %name,
                hostname = %desired.hostname,
                "ingress created"
            );
            return Ok(ReconcileOutcome::Created(created));
        };

        if existing.metadata.deletion_timestamp.is_some() {
            return Err(ReconcileError::new(
                "create",
                namespace,
                &name,
                StoreError::Conflict("ingress is still being deleted".to_string()),
            ));
        }

        let Some(current) = tls_host(&existing) else {
            tracing::warn!(
                namespace = %namespace,
                ingress = %name,
                "ingress exists without a TLS host, leaving it untouched"
            );
            return Ok(ReconcileOutcome::Unrecognized(existing));
        };

        if current == desired.hostname {
            tracing::debug!(
                namespace = %namespace,
                ingress = %name,
                hostname = %current,
                "ingress already has the desired hostname"
            );
            return Ok(ReconcileOutcome::Unchanged(existing));
        }

        tracing::info!(
            namespace = %namespace,
            ingress = %name,
            from = %current,
            to = %desired.hostname,
            "hostname changed, replacing ingress"
        );

        let mut updated = existing.clone();
        updated.spec = build_ingress(namespace, desired).spec;
        updated
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let replaced = self
            .store
            .replace(namespace, &updated)
            .await
            .map_err(|e| ReconcileError::new("replace", namespace, &name, e))?;

        tracing::info!(
            namespace = %namespace,
            service = %service_name,
            ingress = %name,
            hostname = %desired.hostname,
            "ingress replaced"
        );
        Ok(ReconcileOutcome::Replaced(replaced))
    }

    /// Deletes the Ingress owned by `service_name`. Deleting an absent or
    /// already terminating Ingress succeeds without a write.
    pub async fn delete(&self, namespace: &str, service_name: &str) -> Result<DeleteOutcome> {
        let name = ingress_name(service_name);

        match self.store.get(namespace, &name).await {
            Ok(existing) if existing.metadata.deletion_timestamp.is_some() => {
                tracing::debug!(
                    namespace = %namespace,
                    ingress = %name,
                    "ingress already terminating"
                );
                return Ok(DeleteOutcome::AlreadyAbsent);
            }
            Ok(_) => {}
            Err(StoreError::NotFound) => return Ok(DeleteOutcome::AlreadyAbsent),
            Err(e) => return Err(ReconcileError::new("get", namespace, &name, e)),
        }

        match self.store.delete(namespace, &name).await {
            Ok(()) => {
                tracing::info!(namespace = %namespace, ingress = %name, "ingress deleted");
                Ok(DeleteOutcome::Deleted)
            }
            // Someone else removed it between the get and the delete.
            Err(StoreError::NotFound) => Ok(DeleteOutcome::AlreadyAbsent),
            Err(e) => Err(ReconcileError::new("delete", namespace, &name, e)),
        }
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        desired: &DesiredIngress,
    ) -> Result<Ingress> {
        let ingress = build_ingress(namespace, desired);
        self.store
            .create(namespace, &ingress)
            .await
            .map_err(|e| ReconcileError::new("create", namespace, name, e))
    }
}
