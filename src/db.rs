//! Connection management for the per-group index store and the shared
//! conversion cache store.
//!
//! Both are SQLite databases opened in WAL mode with a busy timeout so
//! that the single-writer indexing queue and concurrent readers (search,
//! the tool endpoint) never see `SQLITE_BUSY` under normal load.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

async fn open(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open this group's index store (collections/sources/document_chunks/
/// chunks_fts/chunk_vectors). One writer at a time by convention
/// ([`crate::leader`]), many readers.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    open(&config.group_index_db_path(), 5).await
}

/// Open the shared, group-independent content-addressed conversion cache
/// (see [`crate::convert_cache`]). Shared across every group on the host
/// since a given file's converted text never depends on which group is
/// indexing it.
pub async fn connect_shared(config: &Config) -> Result<SqlitePool> {
    open(&config.shared_db_path, 5).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_creates_parent_directory_and_wal_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("index.db");
        let pool = open(&db_path, 1).await.unwrap();
        assert!(db_path.exists());
        pool.close().await;
    }
}
