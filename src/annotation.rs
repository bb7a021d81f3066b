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

//! Derivation of the desired Ingress from a Service's opt-in annotation.
//!
//! Everything here is pure: the desired state is recomputed from the Service
//! snapshot on every event and never persisted.

use std::fmt;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

/// Annotation a Service carries to opt in to an auto-generated Ingress.
pub const AUTO_INGRESS_ANNOTATION: &str = "jsgtechnology.com/tailscale-autoingress";

/// Annotation value meaning "use the Service name as the hostname".
pub const HOSTNAME_FROM_SERVICE: &str = "true";

/// Ingress class stamped on every generated Ingress.
pub const INGRESS_CLASS_NAME: &str = "tailscale";

/// Suffix appended to the Service name to form the Ingress name.
pub const INGRESS_NAME_SUFFIX: &str = "-ingress";

/// Returns the deterministic Ingress name owned by the given Service.
pub fn ingress_name(service_name: &str) -> String {
    format!("{}{}", service_name, INGRESS_NAME_SUFFIX)
}

/// Returns the opt-in annotation value, if the Service carries it.
pub fn annotation_value(service: &Service) -> Option<&str> {
    service
        .annotations()
        .get(AUTO_INGRESS_ANNOTATION)
        .map(String::as_str)
}

/// The Ingress a Service asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredIngress {
    /// Host placed in the single TLS entry.
    pub hostname: String,
    /// Service the default backend points at.
    pub backend_service_name: String,
    /// First declared port of that Service.
    pub backend_port: i32,
}

/// Why no Ingress is desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The Service does not carry the opt-in annotation.
    NoAnnotation,
    /// The Service is annotated but declares no ports.
    NoPorts,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoAnnotation => f.write_str("annotation not present"),
            SkipReason::NoPorts => f.write_str("no ports defined"),
        }
    }
}

/// Desired state of the dependent Ingress, derived from one Service snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredIngressState {
    /// No Ingress should exist.
    Absent(SkipReason),
    /// An Ingress with these attributes should exist.
    Present(DesiredIngress),
}

impl DesiredIngressState {
    /// Returns the desired Ingress attributes, if any.
    pub fn ingress(&self) -> Option<&DesiredIngress> {
        match self {
            DesiredIngressState::Present(desired) => Some(desired),
            DesiredIngressState::Absent(_) => None,
        }
    }
}

/// Derives the desired Ingress state from a Service.
///
/// The hostname is the Service name when the annotation holds the
/// [`HOSTNAME_FROM_SERVICE`] sentinel and the annotation value verbatim
/// otherwise. Hostnames are not validated here; a malformed value surfaces
/// when the store rejects the write.
///
/// Only the first declared port is used as the backend.
pub fn derive(service: &Service) -> DesiredIngressState {
    let Some(value) = annotation_value(service) else {
        return DesiredIngressState::Absent(SkipReason::NoAnnotation);
    };

    let first_port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first());

    let Some(port) = first_port else {
        return DesiredIngressState::Absent(SkipReason::NoPorts);
    };

    let service_name = service.name_any();
    let hostname = if value == HOSTNAME_FROM_SERVICE {
        service_name.clone()
    } else {
        value.to_string()
    };

    DesiredIngressState::Present(DesiredIngress {
        hostname,
        backend_service_name: service_name,
        backend_port: port.port,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    use super::*;

    fn service(annotation: Option<&str>, ports: &[i32]) -> Service {
        let annotations = annotation.map(|value| {
            BTreeMap::from([(AUTO_INGRESS_ANNOTATION.to_string(), value.to_string())])
        });
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                annotations,
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|port| ServicePort {
                            port: *port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_annotation_is_absent() {
        let state = derive(&service(None, &[80]));
        assert_eq!(state, DesiredIngressState::Absent(SkipReason::NoAnnotation));
        assert!(state.ingress().is_none());
    }

    #[test]
    fn test_no_ports_is_absent_for_any_value() {
        for value in ["true", "custom.host", ""] {
            let state = derive(&service(Some(value), &[]));
            assert_eq!(state, DesiredIngressState::Absent(SkipReason::NoPorts));
        }
    }

    #[test]
    fn test_missing_spec_counts_as_no_ports() {
        let mut svc = service(Some("true"), &[]);
        svc.spec = None;
        assert_eq!(derive(&svc), DesiredIngressState::Absent(SkipReason::NoPorts));
    }

    #[test]
    fn test_sentinel_uses_service_name() {
        let state = derive(&service(Some("true"), &[80]));
        assert_eq!(
            state.ingress(),
            Some(&DesiredIngress {
                hostname: "web".to_string(),
                backend_service_name: "web".to_string(),
                backend_port: 80,
            })
        );
    }

    #[test]
    fn test_explicit_hostname_is_verbatim() {
        let state = derive(&service(Some("Not A Valid Host"), &[8080]));
        let desired = state.ingress().unwrap();
        assert_eq!(desired.hostname, "Not A Valid Host");
        assert_eq!(desired.backend_port, 8080);
    }

    #[test]
    fn test_only_first_port_is_used() {
        let state = derive(&service(Some("true"), &[443, 80, 9090]));
        assert_eq!(state.ingress().unwrap().backend_port, 443);
    }

    #[test]
    fn test_ingress_name() {
        assert_eq!(ingress_name("s1"), "s1-ingress");
    }
}
