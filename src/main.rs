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

//! custom-metrics-apiserver - resolves the configuration of a custom metrics
//! API server.
//!
//! The binary parses and validates the server options, applies them onto a
//! fresh runtime configuration and reports the result. Unless `--dry-run` is
//! given it then keeps the shared informers running until shutdown.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use custom_metrics_apiserver_rust::options::{OptionsFile, ServerOptions};
use custom_metrics_apiserver_rust::server_config::ServerConfig;

/// Custom metrics API server
///
/// Serves the custom metrics API behind delegated authentication and
/// authorization, with the generic API server's serving, audit and
/// feature options.
#[derive(Parser, Debug)]
#[command(name = "custom-metrics-apiserver")]
#[command(author = "Kubernetes Authors")]
#[command(version = custom_metrics_apiserver_rust::VERSION)]
#[command(about = "Custom metrics API server", long_about = None)]
struct Args {
    /// Path to the kubeconfig file of the cluster the adapter reads from
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// Path to the adapter configuration file (OpenAPI documents, metrics)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = ServerOptions::add_flags(Args::command()).get_matches();
    let args = Args::from_arg_matches(&matches)?;

    init_logging(&args.log_level, args.log_json)?;

    info!("starting custom-metrics-apiserver");

    let mut options = ServerOptions::new();
    options
        .apply_flags(&matches)
        .context("failed to read server flags")?;
    if let Some(path) = &args.config {
        load_options_file(path).await?.apply(&mut options);
    }

    let errors = options.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!(component = e.component(), "{}", e);
        }
        anyhow::bail!("{} invalid option(s)", errors.len());
    }

    let client_config = build_client_config(&args).await?;

    let mut config = ServerConfig::default();
    if let Err(e) = options.apply_to(&mut config, &client_config) {
        error!(step = %e.step(), infrastructure = e.is_infrastructure(), "{:#}", e);
        return Err(e.into());
    }

    let summary = serde_yaml::to_string(&config.summary())
        .context("failed to serialize server configuration")?;
    println!("{}", summary);

    if args.dry_run {
        return Ok(());
    }

    let Some(informers) = config.shared_informer_factory.clone() else {
        warn!("no shared informers configured, exiting");
        return Ok(());
    };

    let cancel = CancellationToken::new();
    let started = informers.start(&cancel);
    info!(informers = started, "started shared informers");

    tokio::select! {
        synced = informers.wait_for_cache_sync() => {
            for (kind, ok) in synced {
                if ok {
                    info!(kind = %kind, "informer cache synced");
                } else {
                    warn!(kind = %kind, "informer stopped before its cache synced");
                }
            }
            wait_for_shutdown().await?;
        }
        result = wait_for_shutdown() => result?,
    }

    cancel.cancel();
    info!("custom-metrics-apiserver exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let directive: Directive = level
        .parse()
        .with_context(|| format!("invalid log level: {}", level))?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
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

/// Loads the adapter configuration file.
async fn load_options_file(path: &Path) -> anyhow::Result<OptionsFile> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file: {:?}", path))?;

    OptionsFile::from_yaml(&content)
        .with_context(|| format!("failed to parse config file: {:?}", path))
}

/// Builds the configuration of the external client.
async fn build_client_config(args: &Args) -> anyhow::Result<kube::Config> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let config = if let Some(kubeconfig_path) = &args.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?;
        if let Some(master_url) = &args.master {
            config.cluster_url = parse_master(master_url)?;
        }
        config
    } else if let Some(master_url) = &args.master {
        Config::new(parse_master(master_url)?)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    info!(cluster_url = %config.cluster_url, "external client configuration loaded");
    Ok(config)
}

fn parse_master(master_url: &str) -> anyhow::Result<http::Uri> {
    master_url
        .parse::<http::Uri>()
        .with_context(|| format!("invalid master URL: {}", master_url))
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
