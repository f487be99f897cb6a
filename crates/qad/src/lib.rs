//! qad - QA test execution workflow daemon
//!
//! Library components for the daemon process.

pub mod notify;
pub mod orchestrator;
pub mod ports;
pub mod server;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use orchestrator::Orchestrator;
use qa_core::Config;
use server::AppState;
use storage::Storage;
use tokio::sync::Notify;
use tracing::info;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7710).
    pub port: u16,
    /// Bearer token required on every request when set.
    pub auth_token: Option<String>,
    /// Workflow settings.
    pub workflow: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("QAD_AUTH_TOKEN").ok(),
            workflow: Config::default(),
        }
    }
}

/// Get the default database path (~/.local/share/qad/qad.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("qad").join("qad.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    state: Arc<AppState>,
    shutdown: Notify,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let workflow = Orchestrator::new(
            Arc::clone(&storage),
            Arc::clone(&storage),
            config.workflow.clone(),
        );
        let state = Arc::new(AppState {
            storage,
            workflow,
            auth_token: config.auth_token.clone(),
        });

        Ok(Self {
            config,
            state,
            shutdown: Notify::new(),
        })
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.state.storage
    }

    /// Serve the control plane until shutdown is requested.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("qad starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }
        let workflow = &self.config.workflow;
        info!(
            "self-serve execution: {}, archive on reassign: {}",
            workflow.self_serve_execution, workflow.archive_on_reassign
        );

        tokio::select! {
            result = server::start_server(Arc::clone(&self.state), self.config.port) => result,
            () = self.shutdown.notified() => {
                info!("shutdown signal received, exiting");
                Ok(())
            }
        }
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.notify_one();
    }
}
