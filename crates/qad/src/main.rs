//! qad - QA test execution workflow daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::{eyre, WrapErr};
use qa_core::Config;
use qad::{Daemon, DaemonConfig, DEFAULT_PORT};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "qad", about = "QA test execution workflow daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path (default: $XDG_DATA_HOME/qad/qad.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Workflow config file (key=value lines)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut workflow = Config::default();
    if let Some(path) = &cli.config {
        let unknown = workflow
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
        for key in unknown {
            warn!("ignoring unknown config key: {}", key);
        }
        info!("loaded workflow config from {}", path.display());
    }

    let mut config = DaemonConfig {
        port: cli.port,
        workflow,
        ..Default::default()
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .map_err(|e| eyre!("failed to initialize daemon: {e}"))?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = daemon.run() => {
                    result.map_err(|e| eyre!("daemon error: {e}"))?;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating graceful shutdown");
                    daemon.shutdown();
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                    daemon.shutdown();
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => {
                    result.map_err(|e| eyre!("daemon error: {e}"))?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, initiating graceful shutdown");
                    daemon.shutdown();
                }
            }
        }

        Ok(())
    })
}
