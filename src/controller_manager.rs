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

//! Controller manager - the main orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::AutoIngressConfig;
use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::{resync_period_fn, ControllerContext};
use crate::health::{FunctionHealthChecker, HealthRegistry, HealthServer};

/// Runs registered controllers until shutdown.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use tailscale_autoingress::{AutoIngressConfig, AutoIngressController, ControllerManager};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = AutoIngressConfig::default();
///     let client = kube::Client::try_default().await?;
///     let controller = AutoIngressController::new(&config.auto_ingress);
///     let mut manager = ControllerManager::new(config, client);
///     manager.register_controller(Arc::new(controller));
///     manager.run().await?;
///     Ok(())
/// }
/// ```
pub struct ControllerManager {
    /// Configuration for this instance.
    config: Arc<AutoIngressConfig>,

    /// Kubernetes client.
    client: kube::Client,

    /// Controllers to run.
    controllers: Vec<Arc<dyn Controller>>,

    /// Readiness checks served by the health server.
    health: HealthRegistry,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl ControllerManager {
    /// Creates a new controller manager.
    pub fn new(config: AutoIngressConfig, client: kube::Client) -> Self {
        Self {
            config: Arc::new(config),
            client,
            controllers: Vec::new(),
            health: HealthRegistry::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Adds a controller to run.
    pub fn register_controller(&mut self, controller: Arc<dyn Controller>) -> &mut Self {
        self.controllers.push(controller);
        self
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs the controller manager.
    ///
    /// This will:
    /// 1. Build the controller context
    /// 2. Register readiness checks and start the health server
    /// 3. Run all controllers concurrently
    /// 4. Wait for shutdown signal or errors
    pub async fn run(&self) -> Result<()> {
        tracing::info!("starting controller manager");

        if self.controllers.is_empty() {
            tracing::warn!("no controllers registered, exiting");
            return Ok(());
        }

        let ctx = self.build_controller_context();

        for controller in &self.controllers {
            let checked = controller.clone();
            let checker = FunctionHealthChecker::new(controller.name(), move || {
                let checked = checked.clone();
                async move { checked.health_check().await }
            });
            self.health.register(Arc::new(checker)).await;
        }

        if self.config.generic.enable_healthz {
            let server = HealthServer::new(
                self.config.generic.bind_address.clone(),
                self.config.generic.healthz_bind_port,
                self.health.clone(),
            );
            let handle = server.spawn(self.shutdown_token.clone());
            tokio::spawn(async move {
                match handle.await {
                    Ok(Err(e)) => tracing::error!(error = %e, "health server failed"),
                    Err(e) => tracing::error!(error = %e, "health server task failed"),
                    Ok(Ok(())) => {}
                }
            });
        }

        self.run_controllers(ctx).await
    }

    fn build_controller_context(&self) -> ControllerContext {
        let resync_fn = Arc::new(resync_period_fn(self.config.generic.min_resync_period));
        ControllerContext::new(self.client.clone(), self.config.clone(), resync_fn)
    }

    /// Runs all controllers concurrently.
    async fn run_controllers(&self, ctx: ControllerContext) -> Result<()> {
        let mut join_set = JoinSet::new();

        for controller in &self.controllers {
            let controller = controller.clone();
            let name = controller.name().to_string();
            let ctx = ctx.clone();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();

            join_set.spawn(async move {
                tracing::info!(
                    controller = %name,
                    workers = controller.worker_count(),
                    "starting controller"
                );

                running.write().await.insert(name.clone());
                let result = controller.run(ctx, cancel).await;
                running.write().await.remove(&name);

                match result {
                    Ok(()) => {
                        tracing::info!(controller = %name, "controller terminated successfully");
                    }
                    Err(ref e) => {
                        tracing::error!(controller = %name, error = %e, "controller terminated with error");
                    }
                }

                (name, result)
            });
        }

        let finished = tokio::select! {
            result = join_controllers(&mut join_set) => Some(result),
            _ = self.shutdown_token.cancelled() => None,
        };

        match finished {
            Some(Ok(())) => return Ok(()),
            Some(Err(e)) => {
                // Stop the others before reporting.
                self.shutdown_token.cancel();
                self.wait_for_controllers(&mut join_set).await;
                return Err(e);
            }
            None => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        self.wait_for_controllers(&mut join_set).await;
        Ok(())
    }

    /// Waits for remaining controllers, up to the shutdown timeout.
    async fn wait_for_controllers(&self, join_set: &mut JoinSet<(String, Result<()>)>) {
        let deadline = tokio::time::Instant::now() + self.config.generic.shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                if !running.is_empty() {
                    tracing::warn!(
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "shutdown timeout reached, controllers still running"
                    );
                }
                join_set.abort_all();
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(Ok((name, Ok(())))) => {
                            tracing::debug!(controller = %name, "controller stopped");
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "controller task failed");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }
    }
}

/// Waits for every controller to finish, returning early on the first failure.
async fn join_controllers(join_set: &mut JoinSet<(String, Result<()>)>) -> Result<()> {
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok((name, Ok(()))) => {
                tracing::debug!(controller = %name, "controller finished");
            }
            Ok((name, Err(e))) => {
                return Err(ControllerError::Runtime {
                    name,
                    source: e.into(),
                });
            }
            Err(e) => {
                if e.is_panic() {
                    tracing::error!("controller task panicked");
                }
                return Err(ControllerError::Runtime {
                    name: "unknown".to_string(),
                    source: e.into(),
                });
            }
        }
    }
    Ok(())
}
