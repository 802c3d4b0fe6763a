use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use porthold::config::{PartialConfig, RestartPolicy};
use porthold::server::{Server, watch_signals};

/// Run a backend under supervision and proxy connections to it
#[derive(Parser, Debug)]
#[command(name = "porthold", version, about, long_about = None)]
struct Args {
    /// Public address to listen on (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Backend endpoint: unix:/path, /path, host:port or tcp://host:port
    #[arg(short, long)]
    backend: Option<String>,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Restart policy: never, on-failure, always
    #[arg(long)]
    restart: Option<RestartPolicy>,

    /// Maximum automatic restarts before giving up
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Drain timeout on shutdown, in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,

    /// How long the backend may take to accept connections, in milliseconds
    #[arg(long)]
    startup_timeout_ms: Option<u64>,

    /// How long a client waits for the backend, in milliseconds
    #[arg(long)]
    connect_retry_ms: Option<u64>,

    /// Library to preload into the backend (LD_PRELOAD)
    #[arg(long)]
    preload: Option<PathBuf>,

    /// Port whose bind the preloaded hook redirects to the backend socket
    #[arg(long)]
    intercept_port: Option<u16>,

    /// Working directory for the backend
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Extra backend environment, KEY=VALUE
    #[arg(short, long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command that starts the backend
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    fn into_partial(self) -> PartialConfig {
        PartialConfig {
            listen: self.listen,
            backend: self.backend,
            command: Some(self.command).filter(|c| !c.is_empty()),
            env: self.env.into_iter().collect::<BTreeMap<_, _>>(),
            working_dir: self.workdir,
            preload: self.preload,
            intercept_port: self.intercept_port,
            restart_policy: self.restart,
            max_restarts: self.max_restarts,
            startup_timeout_ms: self.startup_timeout_ms,
            connect_retry_ms: self.connect_retry_ms,
            shutdown_grace_ms: self.grace_ms,
            ..PartialConfig::default()
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let mut partial = PartialConfig::default();
    if let Some(path) = &args.config {
        partial = partial.merge(PartialConfig::from_file(path)?);
    }
    partial = partial
        .merge(PartialConfig::from_env()?)
        .merge(args.into_partial());

    let config = partial.resolve().context("Invalid configuration")?;

    tracing::info!(
        listen = %config.listen_addr,
        backend = %config.backend,
        command = %config.command_line(),
        policy = %config.restart_policy,
        max_restarts = config.max_restarts,
        "Starting porthold v{}",
        env!("CARGO_PKG_VERSION")
    );

    let server = Server::bind(config).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = watch_signals(shutdown).await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    });

    match server.run().await {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "Fatal error, exiting");
            Err(e.into())
        }
    }
}
