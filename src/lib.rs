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

//! tailscale-autoingress - keeps a Tailscale Ingress next to every opted-in Service.
//!
//! A Service annotated with `jsgtechnology.com/tailscale-autoingress` gets an
//! Ingress named `<service>-ingress` with ingress class `tailscale`, a single
//! TLS host and a default backend on the Service's first port. The annotation
//! value is either `"true"` (hostname = Service name) or the hostname itself.
//!
//! The crate is organised as:
//! - [`annotation`]: derives the desired Ingress from a Service
//! - [`reconciler`]: converges the Ingress towards the desired state
//! - [`classifier`]: decides which Service events need work
//! - [`informer`]: turns the watch stream into add/update/delete events
//! - [`store`]: Ingress read/write boundary
//! - [`autoingress`], [`controller_manager`]: wiring, workers and shutdown

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod annotation;
pub mod autoingress;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_manager;
pub mod health;
pub mod informer;
pub mod reconciler;
pub mod store;

// Re-export commonly used types
pub use annotation::{derive, DesiredIngress, DesiredIngressState, AUTO_INGRESS_ANNOTATION};
pub use autoingress::{AutoIngressController, CONTROLLER_NAME};
pub use classifier::{classify, EventClassifier, Outcome};
pub use config::AutoIngressConfig;
pub use controller::{Controller, ControllerError};
pub use controller_context::ControllerContext;
pub use controller_manager::ControllerManager;
pub use informer::{DeletedService, ServiceEvent, ServiceKey, Tombstone};
pub use reconciler::{IngressReconciler, ReconcileError, ReconcileOutcome};
pub use store::{InMemoryIngressStore, IngressStore, KubeIngressStore, StoreError};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
