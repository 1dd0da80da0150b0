//! Shared application state for the `wp` binary.

use std::path::PathBuf;

use waypoint_core::workflow::Engine;
use waypoint_infra::config::{load_engine_config, resolve_data_dir};
use waypoint_infra::sqlite::pool::database_url;
use waypoint_infra::sqlite::{DatabasePool, SqliteStateRepository};

use crate::demo;

/// Engine and storage handles used by every command.
pub struct AppState {
    pub repo: SqliteStateRepository,
    pub engine: Engine<SqliteStateRepository>,
}

impl AppState {
    /// Open the data directory, run migrations, and register the demo
    /// workflows.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir(data_dir.as_deref());
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let url = format!("{}?mode=rwc", database_url(&data_dir));
        let pool = DatabasePool::new(&url).await?;
        let repo = SqliteStateRepository::new(pool);

        let engine = Engine::with_persistence(config, repo.clone());
        for workflow in demo::workflows()? {
            engine.register(workflow);
        }

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");
        Ok(Self { repo, engine })
    }
}
