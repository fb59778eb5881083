//! Source retrieval by collection + path.
//!
//! Reassembles a source's full chunk sequence, in order — used by the
//! `ctx get` CLI command and the `get` tool endpoint (`spec.md` §6) so a
//! caller that found a chunk via search can pull the whole document it
//! came from.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub collection_name: String,
    pub path: String,
    pub status: String,
    pub indexed_at: String,
    pub chunks: Vec<ChunkView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub chunk_index: i64,
    pub heading_path: Option<String>,
    pub content: String,
}

/// Fetch every chunk for `(collection_name, path)`, ordered by `chunk_index`.
pub async fn get_source(pool: &SqlitePool, collection_name: &str, path: &str) -> Result<SourceDocument> {
    let source_row = sqlx::query(
        r#"
        SELECT s.indexed_at, s.status
        FROM sources s
        JOIN collections col ON col.id = s.collection_id
        WHERE col.name = ? AND s.path = ?
        "#,
    )
    .bind(collection_name)
    .bind(path)
    .fetch_optional(pool)
    .await?;

    let Some(source_row) = source_row else {
        return Err(HarnessError::Other(anyhow::anyhow!(
            "no source at {collection_name}:{path}"
        )));
    };

    let indexed_at: i64 = source_row.try_get("indexed_at")?;
    let status: String = source_row.try_get("status")?;

    let chunk_rows = sqlx::query(
        r#"
        SELECT dc.chunk_index, dc.heading_path, dc.content
        FROM document_chunks dc
        JOIN sources s ON s.id = dc.source_id
        JOIN collections col ON col.id = s.collection_id
        WHERE col.name = ? AND s.path = ?
        ORDER BY dc.chunk_index ASC
        "#,
    )
    .bind(collection_name)
    .bind(path)
    .fetch_all(pool)
    .await?;

    let chunks = chunk_rows
        .into_iter()
        .map(|row| ChunkView {
            chunk_index: row.try_get("chunk_index").unwrap_or_default(),
            heading_path: row.try_get("heading_path").ok(),
            content: row.try_get("content").unwrap_or_default(),
        })
        .collect();

    Ok(SourceDocument {
        collection_name: collection_name.to_string(),
        path: path.to_string(),
        status,
        indexed_at: format_ts_iso(indexed_at),
        chunks,
    })
}

/// CLI entry point — calls [`get_source`] and prints the reassembled
/// document to stdout.
pub async fn run_get(pool: &SqlitePool, collection_name: &str, path: &str) -> Result<()> {
    let doc = get_source(pool, collection_name, path).await?;

    println!("--- {} / {} ---", doc.collection_name, doc.path);
    println!("status:     {}", doc.status);
    println!("indexed_at: {}", doc.indexed_at);
    println!();

    for chunk in &doc.chunks {
        if let Some(heading) = &chunk.heading_path {
            println!("[{}] {}", chunk.chunk_index, heading);
        } else {
            println!("[{}]", chunk.chunk_index);
        }
        println!("{}", chunk.content);
        println!();
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexers::{get_or_create_collection, sync_items};
    use crate::models::{CollectionType, SourceItem};
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn get_source_reassembles_chunks_in_order() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();

        let cache_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let cache = crate::convert_cache::ConvertCache::open(cache_pool).await.unwrap();
        let config: crate::config::Config = toml::from_str("[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n").unwrap();

        let collection_id = get_or_create_collection(&pool, "notes", CollectionType::Vault, None)
            .await
            .unwrap();
        let long_body = "para one.\n\n".to_string() + &"word ".repeat(500) + "\n\npara two.";
        let item = SourceItem {
            collection_name: "notes".to_string(),
            collection_type: CollectionType::Vault,
            path: "a.md".to_string(),
            title: None,
            content_type: "text/markdown".to_string(),
            source_type: "markdown".to_string(),
            body: long_body,
            raw_bytes: None,
            mtime: None,
            size: None,
            metadata: Default::default(),
            pre_chunked: None,
        };
        sync_items(&config, &pool, &cache, &collection_id, vec![item], None, false)
            .await
            .unwrap();

        let doc = get_source(&pool, "notes", "a.md").await.unwrap();
        assert!(!doc.chunks.is_empty());
        for (i, chunk) in doc.chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i64);
        }
    }

    #[tokio::test]
    async fn get_source_errors_for_unknown_path() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let err = get_source(&pool, "notes", "missing.md").await;
        assert!(err.is_err());
    }
}
