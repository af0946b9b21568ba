//! Daemon - the control-plane service
//!
//! Owns startup (database cleanup, registry spawn, HTTP bind) and orderly
//! shutdown: a root cancellation token fans out to the registry control task
//! and every connection loop, and a task tracker waits for all of them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{self, ApiState};
use crate::db::{self, DatakitRepo, DbPool};
use crate::registry::Registry;
use crate::{Config, Result};

/// The DCA daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the data directory or database cannot be initialized
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.db_path();
        let db = db::init(&db_path)?;
        tracing::info!(path = %db_path.display(), "database ready");
        Ok(Self { config, db })
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if startup cleanup or the HTTP server fails
    pub async fn run(self) -> Result<()> {
        let repo = DatakitRepo::new(self.db.clone());
        repo.startup_cleanup(self.config.stale_window)?;

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let registry = Registry::spawn(
            repo.clone(),
            self.config.registry_settings(),
            tracker.clone(),
            cancel.clone(),
        );

        let state = Arc::new(ApiState { registry, repo });
        let app = api::router(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        tracing::info!(port = self.config.port, "dca server listening");

        let shutdown = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupt received, shutting down");
                    }
                    () = shutdown.cancelled() => {}
                }
                shutdown.cancel();
            })
            .await?;

        // Wait for the control task and every connection loop to drain
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        tracing::info!("shutdown complete");
        Ok(())
    }
}
