//! LVM Backup Kubernetes Operator
//!
//! Main entry point for the per-node operator. Loads the node config, sets
//! up the volume service and the Kubernetes client, and runs the Backup and
//! Restore reconciliation loops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lvm_backup_operator::{
    config::{NodeConfig, Settings, DEFAULT_DRIVER_NAME},
    controllers::{self, Context},
    lvm::{self, DeviceClassManager, LvService, LvmCommand},
    metrics,
};

/// Per-node LVM volume and backup operator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this instance runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Node config file (device classes and scripts)
    #[arg(long, env = "LVM_BACKUP_CONFIG", default_value = "/etc/lvm-backup/config.yaml")]
    config: PathBuf,

    /// Metrics and health port
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,

    /// Path of the lvm binary
    #[arg(long, env = "LVM_PATH", default_value = "/sbin/lvm")]
    lvm_path: PathBuf,

    /// CSI driver whose volumes may be backed up
    #[arg(long, env = "DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Seconds between checks of an in-progress backup or restore
    #[arg(long, env = "REQUEUE_INTERVAL_SECS", default_value_t = 30)]
    requeue_interval_secs: u64,

    /// Deadline in seconds for each API or script call while reconciling
    #[arg(long, env = "REMOTE_TIMEOUT_SECS", default_value_t = 60)]
    remote_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    init_tracing();

    info!(node = %args.node_name, "Starting LVM Backup Operator");

    let node_config = NodeConfig::load(&args.config)?;
    info!(
        device_classes = node_config.device_classes.len(),
        config = %args.config.display(),
        "Loaded node config"
    );

    let service = Arc::new(LvService::new(
        DeviceClassManager::new(node_config.device_classes.clone()),
        Arc::new(LvmCommand::new(&args.lvm_path)),
        &node_config.backup,
        &node_config.restore,
    ));

    let settings = Settings {
        node_name: args.node_name.clone(),
        driver_name: args.driver_name.clone(),
        requeue_interval: Duration::from_secs(args.requeue_interval_secs),
        remote_timeout: Duration::from_secs(args.remote_timeout_secs),
    };

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let context = Arc::new(Context::new(client.clone(), settings, service.clone()));

    let shutdown = CancellationToken::new();
    let capacity_handle = tokio::spawn(lvm::watch_capacity(service.clone(), shutdown.clone()));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(args.metrics_port));
    info!("Metrics server starting on port {}", args.metrics_port);

    let backup_controller = controllers::run_backup_controller(client.clone(), context.clone());
    let restore_controller = controllers::run_restore_controller(client.clone(), context.clone());

    // Handle graceful shutdown
    tokio::select! {
        _ = backup_controller => {
            error!("Backup controller exited unexpectedly");
        }
        _ = restore_controller => {
            error!("Restore controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    shutdown.cancel();
    let _ = capacity_handle.await;

    info!("LVM Backup Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
