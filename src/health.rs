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

//! Health check endpoints.
//!
//! - `/healthz`, `/healthz/live`: process is up
//! - `/healthz/ready`: every registered checker passes
//! - `/healthz/deep`: per-checker status as JSON

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub checks: HashMap<String, HealthStatus>,
}

/// Components implement this to take part in readiness.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    name: String,
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    /// Creates a new function-based health checker.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin((self.check_fn)())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Registered health checkers.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Runs all health checks and returns the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut overall_healthy = true;

        for checker in checkers.iter() {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(checker.name().to_string(), HealthStatus::from(healthy));
        }

        HealthCheck {
            status: HealthStatus::from(overall_healthy),
            checks,
        }
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// HTTP server for the health endpoints.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(bind_address: String, bind_port: u16, registry: HealthRegistry) -> Self {
        Self {
            registry,
            bind_address,
            bind_port,
        }
    }

    /// Serves until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("health server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    async move {
                        Ok::<_, hyper::Error>(respond(req.uri().path(), &registry).await)
                    }
                });

                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    tracing::debug!(error = %e, "health connection failed");
                }
            });
        }
    }

    /// Runs the health server in a background task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run(cancel))
    }
}

fn response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn respond(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" => response(StatusCode::OK, "text/plain", "ok".to_string()),
        "/healthz/ready" => {
            let result = registry.check_all().await;
            if result.status == HealthStatus::Healthy {
                response(StatusCode::OK, "text/plain", "ok".to_string())
            } else {
                response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain",
                    "not ready".to_string(),
                )
            }
        }
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let status = if result.status == HealthStatus::Healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            response(status, "application/json", json)
        }
        _ => response(StatusCode::NOT_FOUND, "text/plain", "not found".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_registry() {
        let registry = HealthRegistry::new();
        registry
            .register(Arc::new(FunctionHealthChecker::new("test", || async { true })))
            .await;

        assert_eq!(registry.len().await, 1);
        assert!(!registry.is_empty().await);

        let result = registry.check_all().await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.checks.get("test"), Some(&HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_ready_reflects_checkers() {
        let registry = HealthRegistry::new();
        assert_eq!(respond("/healthz/ready", &registry).await.status(), StatusCode::OK);

        registry
            .register(Arc::new(FunctionHealthChecker::new("informer", || async {
                false
            })))
            .await;

        let ready = respond("/healthz/ready", &registry).await;
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(ready).await, "not ready");

        // Liveness does not depend on checkers.
        assert_eq!(respond("/healthz", &registry).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deep_reports_json() {
        let registry = HealthRegistry::new();
        registry
            .register(Arc::new(FunctionHealthChecker::new("informer", || async {
                false
            })))
            .await;

        let deep = respond("/healthz/deep", &registry).await;
        assert_eq!(
            deep.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let json: serde_json::Value = serde_json::from_str(&body(deep).await).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["checks"]["informer"], "unhealthy");
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let registry = HealthRegistry::new();
        assert_eq!(
            respond("/metrics", &registry).await.status(),
            StatusCode::NOT_FOUND
        );
    }
}
