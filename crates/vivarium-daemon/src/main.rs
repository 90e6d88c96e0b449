//! vivarium-daemon binary.
//!
//! Exit codes: 0 clean shutdown, 1 startup failure, 2 fatal runtime
//! error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vivarium_daemon::{server, Kernel, KernelConfig};

/// vivarium - agent runtime kernel
#[derive(Parser, Debug)]
#[command(name = "vivarium-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the listening Unix socket
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable namespace/cgroup isolation for spawned agents
    #[arg(long)]
    no_sandbox: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Relay address (host:port) for the tunnel
    #[arg(long)]
    relay: Option<String>,

    /// Machine token presented to the relay
    #[arg(long)]
    relay_token: Option<String>,

    /// Machine identifier presented to the relay
    #[arg(long)]
    machine_id: Option<String>,
}

fn build_config(args: &Args) -> Result<KernelConfig> {
    let mut config = match &args.config {
        Some(path) => KernelConfig::from_file(path)?,
        None => KernelConfig::default(),
    };
    config.apply_env_overrides();

    if let Some(socket) = &args.socket {
        config.socket_path.clone_from(socket);
    }
    if args.no_sandbox {
        config.enable_sandboxing = false;
    }
    if let Some(relay) = &args.relay {
        config.tunnel.relay_addr = Some(relay.clone());
        config.tunnel.auto_connect = true;
    }
    if let Some(token) = &args.relay_token {
        config.tunnel.token = Some(token.clone());
    }
    if let Some(machine_id) = &args.machine_id {
        config.tunnel.machine_id = Some(machine_id.clone());
    }
    Ok(config)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vivarium={level},vivarium_daemon={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("startup failed: {e:#}");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Startup(e)) => {
            error!("startup failed: {e:#}");
            ExitCode::from(1)
        }
        Err(RunError::Fatal(e)) => {
            error!("fatal runtime error: {e:#}");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    Startup(anyhow::Error),
    Fatal(anyhow::Error),
}

async fn run(config: KernelConfig) -> Result<(), RunError> {
    let auto_connect = config.tunnel.auto_connect && config.tunnel.relay_addr.is_some();
    let socket_path = config.socket_path.clone();
    let kernel = Kernel::new(config);
    info!(
        socket = %socket_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "vivarium kernel starting"
    );

    if auto_connect {
        let connect_kernel = Arc::clone(&kernel);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = vivarium_daemon::tunnel::connect(&connect_kernel) {
                warn!("tunnel auto-connect failed: {e}");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(server::serve(Arc::clone(&kernel), shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")
        .map_err(RunError::Startup)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        result = &mut server => {
            // The server only returns on its own for bind or accept
            // failures.
            let outcome = match result {
                Ok(Ok(())) => Err(RunError::Fatal(anyhow::anyhow!(
                    "server exited unexpectedly"
                ))),
                Ok(Err(e)) => Err(RunError::Startup(e)),
                Err(e) => Err(RunError::Fatal(anyhow::anyhow!("server task panicked: {e}"))),
            };
            let shutdown_kernel = Arc::clone(&kernel);
            let _ = tokio::task::spawn_blocking(move || shutdown_kernel.shutdown()).await;
            return outcome;
        }
    }

    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(RunError::Fatal(e)),
        Err(e) => return Err(RunError::Fatal(anyhow::anyhow!("server task failed: {e}"))),
    }

    let shutdown_kernel = Arc::clone(&kernel);
    let _ = tokio::task::spawn_blocking(move || shutdown_kernel.shutdown()).await;
    server::cleanup_socket(&socket_path);
    info!("kernel stopped");
    Ok(())
}
