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

//! tailscale-autoingress - creates Tailscale Ingresses for annotated Services.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tailscale_autoingress::config::AutoIngressConfig;
use tailscale_autoingress::{AutoIngressController, ControllerManager, AUTO_INGRESS_ANNOTATION};

/// Tailscale auto-ingress controller
///
/// Watches Services in the cluster and maintains an Ingress with ingress
/// class "tailscale" for every Service carrying the
/// jsgtechnology.com/tailscale-autoingress annotation.
#[derive(Parser, Debug)]
#[command(name = "tailscale-autoingress")]
#[command(version)]
#[command(about = "Tailscale Ingress operator", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Namespace to watch (all namespaces if unset)
    #[arg(long)]
    namespace: Option<String>,

    /// The address to serve health checks on
    #[arg(long)]
    bind_address: Option<String>,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Disable the health check server
    #[arg(long)]
    disable_healthz: bool,

    /// Minimum resync period for the Service informer
    #[arg(long, value_parser = parse_duration)]
    min_resync_period: Option<Duration>,

    /// Number of Services reconciled concurrently
    #[arg(long)]
    concurrent_service_syncs: Option<usize>,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!("starting tailscale-autoingress");

    let config = load_config(args).await?;

    info!(
        annotation = AUTO_INGRESS_ANNOTATION,
        namespace = config.generic.namespace.as_deref().unwrap_or("*"),
        resync = %humantime::format_duration(config.generic.min_resync_period),
        "configuration loaded"
    );

    let client = create_client(&config).await?;

    let controller = AutoIngressController::new(&config.auto_ingress);
    let mut manager = ControllerManager::new(config, client);
    manager.register_controller(Arc::new(controller));

    let shutdown_token = manager.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("failed to listen for shutdown signals: {:#}", e);
        }
        shutdown_token.cancel();
    });

    if let Err(e) = manager.run().await {
        error!("controller manager failed: {:#}", e);
        return Err(e.into());
    }

    info!("tailscale-autoingress exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse::<Directive>()
                .with_context(|| format!("invalid log level: {}", level))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file, then applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<AutoIngressConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<AutoIngressConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        AutoIngressConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(namespace) = args.namespace {
        config.generic.namespace = Some(namespace);
    }
    if let Some(bind_address) = args.bind_address {
        config.generic.bind_address = bind_address;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }
    if args.disable_healthz {
        config.generic.enable_healthz = false;
    }
    if let Some(duration) = args.min_resync_period {
        config.generic.min_resync_period = duration;
    }
    if let Some(workers) = args.concurrent_service_syncs {
        config.auto_ingress.concurrent_service_syncs = workers;
    }

    config
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid configuration: {}", reason))?;

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &AutoIngressConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.generic.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        // Local kubeconfig if present, otherwise the in-cluster service account.
        Config::infer().await.context("failed to load cluster config")?
    };

    kube::Client::try_from(kube_config).context("failed to create kubernetes client")
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("received Ctrl+C, shutting down");
    }

    Ok(())
}
