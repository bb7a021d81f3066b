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

//! Event classifier.
//!
//! Maps Service notifications onto reconciler calls. Decisions depend only
//! on the two snapshots carried by the event; no controller state is kept.
//!
//! | Event   | Old annotation | New annotation     | Action    |
//! |---------|----------------|--------------------|-----------|
//! | Added   |                | absent             | skip      |
//! | Added   |                | present            | reconcile |
//! | Updated | absent         | absent             | skip      |
//! | Updated | absent         | present            | reconcile |
//! | Updated | present        | absent             | delete    |
//! | Updated | A              | B, A != B          | reconcile |
//! | Updated | A              | A                  | skip      |
//! | Deleted |                | had annotation     | delete    |
//! | Deleted |                | lacked annotation  | skip      |

use k8s_openapi::api::core::v1::Service;
use thiserror::Error;

use crate::annotation::{self, DesiredIngressState, AUTO_INGRESS_ANNOTATION};
use crate::informer::{DeletedService, ServiceEvent, ServiceKey};
use crate::reconciler::{DeleteOutcome, IngressReconciler, ReconcileError, ReconcileOutcome};
use crate::store::IngressStore;

/// Why an event needs no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// The Service does not carry the annotation.
    NotAnnotated,
    /// The annotation value did not change, e.g. a resync.
    AnnotationUnchanged,
}

/// What to do for an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Nothing.
    Skip(Skip),
    /// Derive the desired state from this Service and reconcile it.
    Reconcile {
        /// Identity of the Service.
        key: ServiceKey,
        /// Current snapshot.
        service: Service,
    },
    /// Delete the Ingress owned by this Service.
    Delete {
        /// Identity of the Service.
        key: ServiceKey,
    },
}

/// An event whose payload cannot be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnrecognizedEvent {
    /// A Service snapshot without a name or namespace.
    #[error("could not parse {0} service object: missing name or namespace")]
    MissingIdentity(&'static str),

    /// A tombstone that carries no last known Service.
    #[error("could not recover service {0} from tombstone")]
    EmptyTombstone(ServiceKey),
}

fn identify(service: &Service, which: &'static str) -> Result<ServiceKey, UnrecognizedEvent> {
    ServiceKey::from_service(service).ok_or(UnrecognizedEvent::MissingIdentity(which))
}

/// Decides what an event requires.
pub fn classify(event: &ServiceEvent) -> Result<Decision, UnrecognizedEvent> {
    match event {
        ServiceEvent::Added(service) => {
            let key = identify(service, "new")?;
            Ok(match annotation::annotation_value(service) {
                Some(_) => Decision::Reconcile {
                    key,
                    service: service.clone(),
                },
                None => Decision::Skip(Skip::NotAnnotated),
            })
        }
        ServiceEvent::Updated { old, new } => {
            identify(old, "old")?;
            let key = identify(new, "new")?;
            let before = annotation::annotation_value(old);
            let after = annotation::annotation_value(new);

            Ok(match (before, after) {
                (None, None) => Decision::Skip(Skip::NotAnnotated),
                (Some(a), Some(b)) if a == b => Decision::Skip(Skip::AnnotationUnchanged),
                (_, Some(_)) => Decision::Reconcile {
                    key,
                    service: new.clone(),
                },
                (Some(_), None) => Decision::Delete { key },
            })
        }
        ServiceEvent::Deleted(deleted) => {
            let service = match deleted {
                DeletedService::Object(service) => service,
                DeletedService::Tombstone(tombstone) => tombstone
                    .last_known
                    .as_ref()
                    .ok_or_else(|| UnrecognizedEvent::EmptyTombstone(tombstone.key.clone()))?,
            };
            let key = identify(service, "deleted")?;

            Ok(match annotation::annotation_value(service) {
                Some(_) => Decision::Delete { key },
                None => Decision::Skip(Skip::NotAnnotated),
            })
        }
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No work was needed.
    Skipped(Skip),
    /// The reconcile path ran.
    Reconciled(ReconcileOutcome),
    /// The delete path ran.
    Deleted(DeleteOutcome),
    /// The event could not be used and was dropped.
    Dropped(UnrecognizedEvent),
    /// A store call failed; the event is abandoned until the next resync.
    Failed(ReconcileError),
}

/// Routes Service events into an [`IngressReconciler`].
pub struct EventClassifier<S> {
    reconciler: IngressReconciler<S>,
}

impl<S: IngressStore> EventClassifier<S> {
    /// Creates a classifier driving the given reconciler.
    pub fn new(reconciler: IngressReconciler<S>) -> Self {
        Self { reconciler }
    }

    /// Handles a single event. Never fails: store errors and unusable
    /// payloads are logged and reported in the returned [`Outcome`].
    pub async fn handle(&self, event: ServiceEvent) -> Outcome {
        let kind = event.kind();

        let decision = match classify(&event) {
            Ok(decision) => decision,
            Err(reason) => {
                tracing::warn!(event = kind, reason = %reason, "dropping service event");
                return Outcome::Dropped(reason);
            }
        };

        match decision {
            Decision::Skip(skip) => {
                tracing::trace!(event = kind, reason = ?skip, "skipping service event");
                Outcome::Skipped(skip)
            }
            Decision::Reconcile { key, service } => {
                let desired = annotation::derive(&service);
                match &desired {
                    DesiredIngressState::Present(ingress) => tracing::info!(
                        event = kind,
                        namespace = %key.namespace,
                        service = %key.name,
                        annotation = AUTO_INGRESS_ANNOTATION,
                        hostname = %ingress.hostname,
                        "reconciling annotated service"
                    ),
                    DesiredIngressState::Absent(reason) => tracing::info!(
                        event = kind,
                        namespace = %key.namespace,
                        service = %key.name,
                        reason = %reason,
                        "skipping ingress for service"
                    ),
                }

                match self
                    .reconciler
                    .reconcile(&key.namespace, &key.name, &desired)
                    .await
                {
                    Ok(outcome) => Outcome::Reconciled(outcome),
                    Err(e) => self.failed(kind, &key, e),
                }
            }
            Decision::Delete { key } => {
                tracing::info!(
                    event = kind,
                    namespace = %key.namespace,
                    service = %key.name,
                    annotation = AUTO_INGRESS_ANNOTATION,
                    "annotation gone, deleting ingress"
                );
                match self.reconciler.delete(&key.namespace, &key.name).await {
                    Ok(outcome) => Outcome::Deleted(outcome),
                    Err(e) => self.failed(kind, &key, e),
                }
            }
        }
    }

    fn failed(&self, kind: &'static str, key: &ServiceKey, err: ReconcileError) -> Outcome {
        tracing::error!(
            event = kind,
            namespace = %key.namespace,
            service = %key.name,
            error = %err,
            "reconcile failed, waiting for next resync"
        );
        Outcome::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    use super::*;
    use crate::informer::Tombstone;
    use crate::store::{InMemoryIngressStore, Operation, StoreError};

    fn svc(annotation: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("s1".to_string()),
                namespace: Some("default".to_string()),
                annotations: annotation.map(|v| {
                    BTreeMap::from([(AUTO_INGRESS_ANNOTATION.to_string(), v.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn key() -> ServiceKey {
        ServiceKey::new("default", "s1")
    }

    fn updated(old: Option<&str>, new: Option<&str>) -> ServiceEvent {
        ServiceEvent::Updated {
            old: svc(old),
            new: svc(new),
        }
    }

    #[test]
    fn test_added() {
        assert_eq!(
            classify(&ServiceEvent::Added(svc(None))),
            Ok(Decision::Skip(Skip::NotAnnotated))
        );
        assert_eq!(
            classify(&ServiceEvent::Added(svc(Some("true")))),
            Ok(Decision::Reconcile {
                key: key(),
                service: svc(Some("true")),
            })
        );
    }

    #[test]
    fn test_updated_transitions() {
        assert_eq!(
            classify(&updated(None, None)),
            Ok(Decision::Skip(Skip::NotAnnotated))
        );
        assert!(matches!(
            classify(&updated(None, Some("true"))),
            Ok(Decision::Reconcile { .. })
        ));
        assert_eq!(
            classify(&updated(Some("true"), None)),
            Ok(Decision::Delete { key: key() })
        );
        assert!(matches!(
            classify(&updated(Some("a.example"), Some("b.example"))),
            Ok(Decision::Reconcile { .. })
        ));
        assert_eq!(
            classify(&updated(Some("true"), Some("true"))),
            Ok(Decision::Skip(Skip::AnnotationUnchanged))
        );
    }

    #[test]
    fn test_deleted_direct_and_tombstone_agree() {
        let direct = ServiceEvent::Deleted(DeletedService::Object(svc(Some("true"))));
        let wrapped = ServiceEvent::Deleted(DeletedService::Tombstone(Tombstone {
            key: key(),
            last_known: Some(svc(Some("true"))),
        }));

        assert_eq!(classify(&direct), Ok(Decision::Delete { key: key() }));
        assert_eq!(classify(&direct), classify(&wrapped));
        assert_eq!(
            classify(&ServiceEvent::Deleted(DeletedService::Object(svc(None)))),
            Ok(Decision::Skip(Skip::NotAnnotated))
        );
    }

    #[test]
    fn test_unusable_payloads() {
        let empty = ServiceEvent::Deleted(DeletedService::Tombstone(Tombstone {
            key: key(),
            last_known: None,
        }));
        assert_eq!(
            classify(&empty),
            Err(UnrecognizedEvent::EmptyTombstone(key()))
        );

        let mut nameless = svc(Some("true"));
        nameless.metadata.name = None;
        assert_eq!(
            classify(&ServiceEvent::Added(nameless)),
            Err(UnrecognizedEvent::MissingIdentity("new"))
        );
    }

    #[tokio::test]
    async fn test_handle_reports_failures_without_panicking() {
        let store = Arc::new(InMemoryIngressStore::new());
        let classifier = EventClassifier::new(IngressReconciler::new(store.clone()));
        store.fail_next(Operation::Get, StoreError::Unavailable("refused".to_string()));

        let outcome = classifier.handle(ServiceEvent::Added(svc(Some("true")))).await;
        assert!(matches!(outcome, Outcome::Failed(_)));

        // The next delivery of the same object converges.
        let outcome = classifier.handle(ServiceEvent::Added(svc(Some("true")))).await;
        assert!(matches!(
            outcome,
            Outcome::Reconciled(ReconcileOutcome::Created(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_annotated_without_ports_removes_ingress() {
        let store = Arc::new(InMemoryIngressStore::new());
        let classifier = EventClassifier::new(IngressReconciler::new(store.clone()));
        classifier.handle(ServiceEvent::Added(svc(Some("true")))).await;
        assert_eq!(store.len(), 1);

        let mut portless = svc(Some("other.host"));
        portless.spec = None;
        let outcome = classifier
            .handle(ServiceEvent::Updated {
                old: svc(Some("true")),
                new: portless,
            })
            .await;

        assert_eq!(
            outcome,
            Outcome::Reconciled(ReconcileOutcome::Removed(DeleteOutcome::Deleted))
        );
        assert!(store.is_empty());
    }
}
