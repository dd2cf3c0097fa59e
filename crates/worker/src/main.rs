//! posa-worker entry point.
//!
//! Hosts the background record store as a child process. Requests arrive as
//! JSON lines on stdin and replies leave on stdout, so logging goes to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use posa_core::store::{RecordStore, StoreWorker};
use posa_core::{AppConfig, SqliteKv, channel::serve_stdio};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load().context("loading configuration")?;

    tokio::fs::create_dir_all(config.databases_dir())
        .await
        .with_context(|| format!("creating {}", config.databases_dir().display()))?;

    let db_path = config.record_db_path();
    let (store, recovery) = RecordStore::open_or_recreate(&db_path)
        .await
        .with_context(|| format!("opening record store at {}", db_path.display()))?;
    let store = store.with_chunk_size(config.chunk_size);

    let mirror = SqliteKv::open(config.local_storage_path()).await.context("opening local storage")?;
    let worker = StoreWorker::new(store).with_mirror(Arc::new(mirror), config.mirror_max_bytes);

    tracing::info!(db = %db_path.display(), ?recovery, "record store worker serving on stdio");
    serve_stdio(worker).await?;

    Ok(())
}
