//! Classification mesh runner.
//!
//! Loads the configuration, builds the mesh, runs its background workers
//! and applies feature-flag reloads until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use classification_mesh::config::loader::load_config;
use classification_mesh::config::watcher::ConfigWatcher;
use classification_mesh::config::MeshConfig;
use classification_mesh::lifecycle::signals::wait_for_shutdown_signal;
use classification_mesh::observability::{logging, metrics};
use classification_mesh::{Mesh, Shutdown};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "classification-mesh", version, about = "Resilient service-communication layer")]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, env = "MESH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => MeshConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!("classification-mesh v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mesh = Mesh::from_config(config)?;
    let shutdown = Shutdown::new();
    let workers = mesh.start_workers(&shutdown);

    // The watcher handle must outlive the loop below.
    let (_watcher, mut reloads) = match &args.config {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            (Some(watcher.run()?), Some(rx))
        }
        None => (None, None),
    };

    let signal = wait_for_shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => break,
            Some(next) = async {
                match reloads.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                mesh.apply_reload(&next);
            }
        }
    }

    shutdown.trigger();
    let aborted = workers.join_all(SHUTDOWN_GRACE).await;
    tracing::info!(aborted, "Shutdown complete");
    Ok(())
}
