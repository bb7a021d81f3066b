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

//! Configuration structures.
//!
//! The annotation key and ingress class are compile-time constants in
//! [`crate::annotation`] and are not configurable.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loadable from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoIngressConfig {
    /// Process-wide settings.
    #[serde(default)]
    pub generic: GenericConfig,

    /// Service to Ingress controller settings.
    #[serde(default)]
    pub auto_ingress: AutoIngressControllerConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Namespace to watch. All namespaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Address the health server binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port for the health check server.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,

    /// Serve health endpoints.
    #[serde(default = "default_enable_healthz")]
    pub enable_healthz: bool,

    /// Base period between full resyncs of the Service cache.
    #[serde(default = "default_min_resync_period", with = "humantime_serde")]
    pub min_resync_period: Duration,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            namespace: None,
            bind_address: default_bind_address(),
            healthz_bind_port: default_healthz_port(),
            enable_healthz: default_enable_healthz(),
            min_resync_period: default_min_resync_period(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10257
}

fn default_enable_healthz() -> bool {
    true
}

fn default_min_resync_period() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Service to Ingress controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoIngressControllerConfig {
    /// Number of workers reconciling Services concurrently. Events for the
    /// same Service always go to the same worker.
    #[serde(default = "default_concurrent_service_syncs")]
    pub concurrent_service_syncs: usize,
}

impl Default for AutoIngressControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_service_syncs: default_concurrent_service_syncs(),
        }
    }
}

fn default_concurrent_service_syncs() -> usize {
    5
}

impl AutoIngressConfig {
    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), String> {
        if self.auto_ingress.concurrent_service_syncs == 0 {
            return Err("concurrentServiceSyncs must be at least 1".to_string());
        }
        if self.generic.min_resync_period.is_zero() {
            return Err("minResyncPeriod must be positive".to_string());
        }
        if matches!(&self.generic.namespace, Some(ns) if ns.is_empty()) {
            return Err("namespace must not be empty".to_string());
        }
        Ok(())
    }
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AutoIngressConfig::default();
        assert_eq!(config.generic.min_resync_period, Duration::from_secs(600));
        assert_eq!(config.auto_ingress.concurrent_service_syncs, 5);
        assert!(config.generic.namespace.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_basic_config() {
        let yaml = r#"
generic:
  namespace: apps
  minResyncPeriod: 5m
  shutdownTimeout: 60s
autoIngress:
  concurrentServiceSyncs: 2
"#;

        let config: AutoIngressConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.generic.namespace.as_deref(), Some("apps"));
        assert_eq!(config.generic.min_resync_period, Duration::from_secs(300));
        assert_eq!(config.generic.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.generic.healthz_bind_port, 10257);
        assert_eq!(config.auto_ingress.concurrent_service_syncs, 2);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: AutoIngressConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.generic.enable_healthz);
        assert_eq!(config.generic.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = AutoIngressConfig::default();
        config.auto_ingress.concurrent_service_syncs = 0;
        assert!(config.validate().is_err());
    }
}
