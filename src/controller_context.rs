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

//! Controller context - shared resources for all controllers.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use rand::Rng;

use crate::config::AutoIngressConfig;

/// Shared context handed to every controller.
///
/// The client is safe for concurrent use; nothing else in here is mutable.
#[derive(Clone)]
pub struct ControllerContext {
    /// Kubernetes client for making API requests.
    pub client: Client,

    /// Configuration for this instance.
    pub config: Arc<AutoIngressConfig>,

    /// Function to generate resync periods.
    ///
    /// Randomized so informers do not all resync at the same moment.
    pub resync_period_fn: Arc<dyn Fn() -> Duration + Send + Sync>,
}

impl ControllerContext {
    /// Creates a new controller context.
    pub fn new(
        client: Client,
        config: Arc<AutoIngressConfig>,
        resync_period_fn: Arc<dyn Fn() -> Duration + Send + Sync>,
    ) -> Self {
        Self {
            client,
            config,
            resync_period_fn,
        }
    }
}

/// Creates a resync period function with the given base duration.
///
/// Each call returns the base plus between 0 and 100% jitter.
pub fn resync_period_fn(base: Duration) -> impl Fn() -> Duration + Send + Sync {
    move || {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
    }
}
