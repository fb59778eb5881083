//! RSS-store indexer.
//!
//! Reads an RSS/Atom reader's own SQLite store (e.g. a NetNewsWire-style
//! database) in read-only mode and syncs articles into the `rss`
//! collection. Only the output contract matters per `spec.md` §1: one row
//! per article with a guid, feed name, title, URL, published date, and
//! body.
//!
//! Like [`crate::indexers::email`], every run enumerates the full store;
//! `sync_items`'s content-hash compare absorbs the cost of unchanged
//! articles cheaply and avoids the stale-source prune wrongly deleting
//! anything outside a query-level cutoff.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::error::{HarnessError, Result};
use crate::indexers::{get_or_create_collection, sync_items};
use crate::models::{CollectionType, IndexResult, SourceItem};

const BUSY_RETRIES: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(500);

pub async fn run(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    force: bool,
) -> Result<IndexResult> {
    let Some(rss_config) = &config.rss else {
        return Ok(IndexResult::default());
    };

    let collection_id = get_or_create_collection(pool, "rss", CollectionType::Rss, Some("")).await?;

    let source_pool = open_readonly_with_retry(&rss_config.db_path).await?;

    let rows = sqlx::query(
        "SELECT article_id, feed_name, title, url, published_at, body FROM articles ORDER BY published_at ASC",
    )
    .fetch_all(&source_pool)
    .await
    .map_err(|e| HarnessError::Other(anyhow::anyhow!("rss store query failed: {e}")))?;

    let mut items = Vec::new();
    let mut max_seen: Option<DateTime<Utc>> = None;

    for row in rows {
        let article_id: String = row.try_get("article_id").unwrap_or_default();
        let feed_name: String = row.try_get("feed_name").unwrap_or_default();
        let title: String = row.try_get("title").unwrap_or_default();
        let url: String = row.try_get("url").unwrap_or_default();
        let published_at: String = row.try_get("published_at").unwrap_or_default();
        let body: String = row.try_get("body").unwrap_or_default();

        let parsed_utc = DateTime::parse_from_rfc3339(&published_at)
            .ok()
            .map(|d| d.with_timezone(&Utc));

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("feed".to_string(), feed_name);
        metadata.insert("url".to_string(), url);
        metadata.insert("date".to_string(), published_at.clone());

        items.push(SourceItem {
            collection_name: "rss".to_string(),
            collection_type: CollectionType::Rss,
            path: article_id,
            title: Some(title),
            content_type: "text/html".to_string(),
            source_type: "article".to_string(),
            body,
            raw_bytes: None,
            mtime: None,
            size: None,
            metadata,
            pre_chunked: None,
        });

        if let Some(parsed_utc) = parsed_utc {
            max_seen = Some(max_seen.map_or(parsed_utc, |m| m.max(parsed_utc)));
        }
    }

    let result = sync_items(config, pool, convert_cache, &collection_id, items, None, force).await?;

    if let Some(watermark_value) = max_seen {
        sqlx::query("UPDATE collections SET description = ? WHERE id = ?")
            .bind(watermark_value.to_rfc3339())
            .bind(&collection_id)
            .execute(pool)
            .await?;
    }

    Ok(result)
}

async fn open_readonly_with_retry(path: &std::path::Path) -> Result<sqlx::SqlitePool> {
    let mut attempt = 0;
    loop {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| HarnessError::Other(e.into()))?
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));

        match SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < BUSY_RETRIES => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "rss store busy, retrying");
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(HarnessError::DocumentLocked(format!(
                    "rss store {} unavailable: {e}",
                    path.display()
                )))
            }
        }
    }
}
