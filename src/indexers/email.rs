//! Mail-store indexer.
//!
//! Reads a mail client's own SQLite store (e.g. an `emclient`-style
//! database) in read-only mode and syncs new messages into the `email`
//! collection. The store's exact schema is this crate's environment, not
//! its concern (per `spec.md` §1, mail-store parsers are out of scope) —
//! only the output contract matters: one row per message with an id,
//! sender, subject, date, and body.
//!
//! The watermark is the latest observed message date, persisted in the
//! collection's `description` field, and advances monotonically. Every
//! run enumerates the full mailbox (messages are immutable, so
//! `sync_items`'s content-hash compare already skips anything unchanged
//! cheaply) rather than filtering by the watermark — filtering the query
//! itself would make `sync_items`'s stale-source prune wrongly delete
//! every message older than the filter, and `spec.md` §3 invariant 6
//! exempts non-filesystem sources from auto-pruning in the first place.
//! The watermark is recorded purely as the latest-seen marker per
//! `spec.md` §3's Source entity.

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
    let Some(email_config) = &config.email else {
        return Ok(IndexResult::default());
    };

    let collection_id =
        get_or_create_collection(pool, "email", CollectionType::Email, Some("")).await?;

    let source_pool = open_readonly_with_retry(&email_config.db_path).await?;

    let rows = sqlx::query(
        "SELECT message_id, sender, subject, received_at, body FROM messages ORDER BY received_at ASC",
    )
    .fetch_all(&source_pool)
    .await
    .map_err(|e| HarnessError::Other(anyhow::anyhow!("mail store query failed: {e}")))?;

    let mut items = Vec::new();
    let mut max_seen: Option<DateTime<Utc>> = None;

    for row in rows {
        let message_id: String = row.try_get("message_id").unwrap_or_default();
        let sender: String = row.try_get("sender").unwrap_or_default();
        let subject: String = row.try_get("subject").unwrap_or_default();
        let received_at: String = row.try_get("received_at").unwrap_or_default();
        let body: String = row.try_get("body").unwrap_or_default();

        let parsed_utc = DateTime::parse_from_rfc3339(&received_at)
            .ok()
            .map(|d| d.with_timezone(&Utc));

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("sender".to_string(), sender.clone());
        metadata.insert("date".to_string(), received_at.clone());

        items.push(SourceItem {
            collection_name: "email".to_string(),
            collection_type: CollectionType::Email,
            path: message_id,
            title: Some(subject),
            content_type: "message/rfc822".to_string(),
            source_type: "email".to_string(),
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

    // Email sources are never pruned by disappearance (they have no
    // filesystem path, per `spec.md` §3 invariant 6) — sync_items is only
    // used here for the chunk/embed/upsert skeleton.
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
                tracing::warn!(attempt, error = %e, "mail store busy, retrying");
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(HarnessError::DocumentLocked(format!(
                    "mail store {} unavailable: {e}",
                    path.display()
                )))
            }
        }
    }
}
