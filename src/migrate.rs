//! Index store schema creation and migration.
//!
//! Creates `collections`, `sources`, `document_chunks`, the `chunks_fts`
//! FTS5 shadow table plus its sync triggers, `chunk_vectors`, and a `meta`
//! table holding `schema_version`. Run via `ctx init` and automatically at
//! startup before the indexing queue or search engine touch the pool.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

pub const SCHEMA_VERSION: i64 = 3;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            collection_type TEXT NOT NULL,
            description TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            source_type TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL,
            mtime INTEGER,
            size INTEGER,
            indexed_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'indexed',
            error TEXT,
            UNIQUE(collection_id, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_chunks (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            collection_id TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            heading_path TEXT,
            title TEXT,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        create_fts_schema(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY REFERENCES document_chunks(id) ON DELETE CASCADE,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_collection ON sources(collection_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_chunks_source ON document_chunks(source_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_chunks_collection ON document_chunks(collection_id)",
    )
    .execute(pool)
    .await?;

    let existing: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
        .fetch_optional(pool)
        .await?;

    match existing {
        None => {
            sqlx::query("INSERT INTO meta(key, value) VALUES ('schema_version', ?)")
                .bind(SCHEMA_VERSION.to_string())
                .execute(pool)
                .await?;
        }
        Some(v) => {
            let found: i64 = v.parse().unwrap_or(0);
            apply_migrations(pool, found).await?;
        }
    }

    Ok(())
}

/// `chunks_fts` indexes both `title` and `content` so a search term that
/// only appears in a source's title (a commit subject line, an email
/// subject, a book title) is still lexically matched.
async fn create_fts_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE chunks_fts USING fts5(
            title,
            content,
            content='document_chunks',
            content_rowid='rowid'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER document_chunks_ai AFTER INSERT ON document_chunks BEGIN
            INSERT INTO chunks_fts(rowid, title, content) VALUES (new.rowid, new.title, new.content);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER document_chunks_ad AFTER DELETE ON document_chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, title, content) VALUES ('delete', old.rowid, old.title, old.content);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER document_chunks_au AFTER UPDATE ON document_chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, title, content) VALUES ('delete', old.rowid, old.title, old.content);
            INSERT INTO chunks_fts(rowid, title, content) VALUES (new.rowid, new.title, new.content);
        END
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn apply_migrations(pool: &SqlitePool, found: i64) -> Result<()> {
    if found > SCHEMA_VERSION {
        bail!(crate::error::HarnessError::SchemaVersionUnknown {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    if found < 2 {
        // v2: collections created under the old single-type scheme with a
        // "git-" description prefix are reclassified as collection_type 'code'.
        sqlx::query(
            "UPDATE collections SET collection_type = 'code' WHERE collection_type = 'project' AND description LIKE 'git-%'",
        )
        .execute(pool)
        .await?;
    }

    if found < 3 {
        sqlx::query("ALTER TABLE sources ADD COLUMN source_type TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
        sqlx::query("ALTER TABLE document_chunks ADD COLUMN title TEXT")
            .execute(pool)
            .await?;
        sqlx::query("ALTER TABLE document_chunks ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}'")
            .execute(pool)
            .await?;

        sqlx::query("DROP TRIGGER IF EXISTS document_chunks_ai").execute(pool).await?;
        sqlx::query("DROP TRIGGER IF EXISTS document_chunks_ad").execute(pool).await?;
        sqlx::query("DROP TRIGGER IF EXISTS document_chunks_au").execute(pool).await?;
        sqlx::query("DROP TABLE IF EXISTS chunks_fts").execute(pool).await?;

        create_fts_schema(pool).await?;

        sqlx::query("INSERT INTO chunks_fts(rowid, title, content) SELECT rowid, title, content FROM document_chunks")
            .execute(pool)
            .await?;
    }

    if found != SCHEMA_VERSION {
        sqlx::query("UPDATE meta SET value = ? WHERE key = 'schema_version'")
            .bind(SCHEMA_VERSION.to_string())
            .execute(pool)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version: String = sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[tokio::test]
    async fn fts_trigger_keeps_index_in_sync_with_inserts_and_deletes() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();

        sqlx::query("INSERT INTO collections(id, name, collection_type, created_at) VALUES ('c1', 'notes', 'vault', 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sources(id, collection_id, path, content_hash, indexed_at) VALUES ('s1', 'c1', 'a.md', 'h', 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO document_chunks(id, source_id, collection_id, chunk_index, content, token_count, content_hash, created_at, updated_at) VALUES ('d1', 's1', 'c1', 0, 'hello world', 2, 'h', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let hits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'hello'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits, 1);

        sqlx::query("DELETE FROM document_chunks WHERE id = 'd1'")
            .execute(&pool)
            .await
            .unwrap();

        let hits_after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'hello'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits_after, 0);
    }
}
