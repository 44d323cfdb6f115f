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

//! service-ingress-controller - exposes every Deployment through a Service
//! and an Ingress.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use service_ingress_controller::config::ControllerConfig;
use service_ingress_controller::controller_manager::ControllerManager;
use service_ingress_controller::health::HealthServer;

/// Service/Ingress controller
///
/// Watches Deployments in every namespace that is not excluded and keeps a
/// Service `<name>-svc` and an Ingress `<name>-ingress` for each of them.
/// When a Deployment is deleted, both are removed.
#[derive(Parser, Debug)]
#[command(name = "service-ingress-controller")]
#[command(version)]
#[command(about = "Exposes Deployments through a Service and an Ingress", long_about = None)]
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

    /// Namespace the controller runs in; never reconciled
    #[arg(long, env = "POD_NAMESPACE")]
    namespace: Option<String>,

    /// Additional namespaces that are never reconciled
    #[arg(long, value_delimiter = ',')]
    exclude_namespaces: Vec<String>,

    /// Ingress class set on generated Ingresses
    #[arg(long)]
    ingress_class: Option<String>,

    /// Number of reconcile workers
    #[arg(long)]
    concurrent_syncs: Option<usize>,

    /// Requeues of a failing key before it is dropped
    #[arg(long)]
    max_retries: Option<u32>,

    /// Upper bound on a single reconcile
    #[arg(long, value_parser = parse_duration)]
    reconcile_timeout: Option<Duration>,

    /// How long to wait for caches to sync at startup
    #[arg(long, value_parser = parse_duration)]
    cache_sync_timeout: Option<Duration>,

    /// How long to wait for workers to stop on shutdown
    #[arg(long, value_parser = parse_duration)]
    shutdown_timeout: Option<Duration>,

    /// The address to serve health checks on
    #[arg(long)]
    bind_address: Option<String>,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Feature gates to enable/disable
    ///
    /// Format: "PrimaryUpdateResync=true,OverwriteDriftedDependents=false"
    #[arg(long)]
    feature_gates: Option<String>,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    let config = load_config(args).await?;
    config
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid configuration: {reason}"))?;

    let client = create_client(&config).await?;

    let health_address = config.generic.bind_address.clone();
    let health_port = config.generic.healthz_bind_port;

    let manager = ControllerManager::new(config, client)?;

    let health = HealthServer::with_registry(
        health_address,
        health_port,
        manager.health_registry().clone(),
    )
    .spawn();

    let shutdown_token = manager.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        shutdown_token.cancel();
    });

    let result = manager.run().await;
    health.abort();

    if let Err(e) = result {
        error!(error = %e, "controller failed");
        return Err(e.into());
    }

    info!("service-ingress-controller exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {level}"))?,
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
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration file, then applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<ControllerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<ControllerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        ControllerConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(namespace) = args.namespace {
        config.generic.namespace = namespace;
    }
    config
        .generic
        .excluded_namespaces
        .extend(args.exclude_namespaces.into_iter().filter(|ns| !ns.is_empty()));
    if let Some(class) = args.ingress_class {
        config.exposure.ingress_class = class;
    }
    if let Some(workers) = args.concurrent_syncs {
        config.exposure.concurrent_syncs = workers;
    }
    if let Some(max_retries) = args.max_retries {
        config.exposure.max_retries = max_retries;
    }
    if let Some(timeout) = args.reconcile_timeout {
        config.exposure.reconcile_timeout = timeout;
    }
    if let Some(timeout) = args.cache_sync_timeout {
        config.generic.cache_sync_timeout = timeout;
    }
    if let Some(timeout) = args.shutdown_timeout {
        config.generic.shutdown_timeout = timeout;
    }
    if let Some(address) = args.bind_address {
        config.generic.bind_address = address;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }
    if let Some(gates) = args.feature_gates {
        config.generic.feature_gates = gates;
    }

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &ControllerConfig) -> anyhow::Result<kube::Client> {
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
        Config::infer().await.context("failed to load kubeconfig")?
    };

    kube::Client::try_from(kube_config).context("failed to create kubernetes client")
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("received SIGINT, shutting down"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to install signal handlers, falling back to ctrl-c");
            }
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
