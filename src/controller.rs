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

//! Core controller trait and errors.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig { name: String, reason: String },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// A control loop run by the [`ControllerManager`](crate::ControllerManager).
///
/// # Lifecycle
///
/// 1. [`Controller::run`] is called with a cancellation token
/// 2. The controller runs until the token is cancelled or an error occurs
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller, used in logs and
    /// health checks.
    fn name(&self) -> &str;

    /// Runs the controller's main loop.
    ///
    /// When the token is cancelled, the controller must let in-flight work
    /// finish, start nothing new, and return `Ok(())`.
    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()>;

    /// Reports whether the controller is ready. Defaults to `true`.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }

    /// Number of workers this controller runs. The default is 1.
    fn worker_count(&self) -> usize {
        1
    }
}
