mod commands;
mod config;
mod convert;
mod credential;
mod error;
mod logging;
mod normalize;
mod proxy;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use reqwest::Client;
use tracing_subscriber::EnvFilter;

use crate::commands::config::handle_config_cmd;
use crate::commands::doctor::handle_doctor_cmd;
use crate::config::{ConverterKind, ProxyConfig, load_config};
use crate::convert::{AzureConverter, RequestConverter};
use crate::normalize::RequestNormalizer;
use crate::proxy::{Gateway, router as proxy_router};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config error: {0}")]
    ProxyConfig(String),
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "deployment-proxy")]
#[command(
    about = "Model-aware reverse proxy for Azure OpenAI style deployments",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP proxy server
    Serve {
        /// Listen port; overrides `port` from the config file
        #[arg(long)]
        port: Option<u16>,
        /// Listen host; overrides `host` from the config file
        #[arg(long)]
        host: Option<String>,
        /// Config file to load instead of ~/.deployment-proxy/config.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Inspect or create the proxy config
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// Validate the config and deployment table without starting the server
    Doctor {
        /// Config file to check instead of the default location
        #[arg(long)]
        config: Option<PathBuf>,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a commented config.toml template
    Init {
        /// Overwrite an existing config.toml
        #[arg(long)]
        force: bool,
    },
    /// List configured deployments
    List {
        /// Config file to read instead of the default location
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    // info by default; RUST_LOG takes over when set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve {
        port: None,
        host: None,
        config: None,
    }) {
        Command::Config { cmd } => {
            handle_config_cmd(cmd).await?;
        }
        Command::Doctor { config, json } => {
            handle_doctor_cmd(config, json).await?;
        }
        Command::Serve { port, host, config } => {
            let mut cfg = load_config(config.as_deref()).await?;
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(host) = host {
                cfg.host = host;
            }
            run_server(cfg).await?;
        }
    }

    Ok(())
}

fn build_converter(cfg: &ProxyConfig) -> Arc<dyn RequestConverter> {
    match cfg.converter {
        ConverterKind::Azure => Arc::new(AzureConverter::new(&cfg.route_prefix)),
    }
}

fn build_client(cfg: &ProxyConfig) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(ms) = cfg.upstream.connect_timeout_ms {
        builder = builder.connect_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = cfg.upstream.request_timeout_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    builder.build().context("failed to build upstream http client")
}

async fn run_server(cfg: ProxyConfig) -> Result<()> {
    // Fail at startup rather than on the first request.
    let registry = cfg.build_registry()?;
    let auth = cfg.backend_auth()?;
    let converter = build_converter(&cfg);
    let normalizer = RequestNormalizer::new(cfg.stripped_fields.iter());
    let client = build_client(&cfg)?;

    for d in registry.deployments() {
        tracing::info!(
            "deployment [{}] -> {} at {} (api-version {}, {})",
            d.model,
            d.deployment_id,
            d.endpoint,
            d.api_version,
            if d.has_auth_key() {
                "deployment key"
            } else {
                "caller token"
            }
        );
    }

    tracing::info!(
        "stripping body fields {:?} before forwarding",
        normalizer.stripped_fields()
    );

    let gateway = Gateway::new(client, Arc::new(registry), converter.clone())
        .with_normalizer(normalizer)
        .with_backend_auth(auth)
        .with_max_body_bytes(cfg.max_body_bytes);
    let app: Router = proxy_router(gateway);

    let addr = cfg.listen_addr()?;
    tracing::info!(
        "deployment-proxy listening on http://{} (converter: {})",
        addr,
        converter.name()
    );

    axum::serve(
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("deployment-proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                tracing::warn!("failed to install signal handlers; falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received, draining connections");
}
