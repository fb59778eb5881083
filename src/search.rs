//! Hybrid search engine (`spec.md` §4.6).
//!
//! Combines a dense (embedding cosine-similarity) candidate list and a
//! lexical (FTS5 BM25) candidate list with Reciprocal Rank Fusion (RRF):
//!
//! ```text
//! score(chunk) = vector_weight / (rrf_k + dense_rank + 1)
//!              + fts_weight    / (rrf_k + lexical_rank + 1)
//! ```
//!
//! where `dense_rank`/`lexical_rank` are 0-based positions in their
//! respective candidate lists and a chunk missing from one list simply
//! contributes nothing from that term. Defaults (`rrf_k = 60`,
//! `vector_weight = 0.7`, `fts_weight = 0.3`) come from
//! [`crate::config::SearchDefaults`].
//!
//! Filters (`collection`, `collection_type`, `path_prefix`, `updated_after`)
//! are applied in memory after both candidate lists are fetched, because
//! SQLite's FTS5 and the brute-force cosine scan don't share an index that
//! could push them down efficiently. To keep filtered queries from starving
//! on a candidate list that's mostly filtered out, each side is oversampled:
//! `top_k * 50` candidates when any filter is set, `top_k * 3` otherwise.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::embedding;
use crate::error::Result;
use crate::models::{CollectionType, SearchFilters, SearchResult};

const OVERSAMPLE_FILTERED: i64 = 50;
const OVERSAMPLE_UNFILTERED: i64 = 3;

struct CandidateRow {
    chunk_id: String,
    source_id: String,
    collection_name: String,
    collection_type: CollectionType,
    source_type: String,
    path: String,
    heading_path: Option<String>,
    title: Option<String>,
    content: String,
    source_mtime: Option<i64>,
    updated_at: i64,
    metadata: HashMap<String, String>,
}

/// Best-effort RFC 3339 parse of a metadata `date` field, falling back to
/// bare `YYYY-MM-DD` (what the email/rss indexers store when the source
/// record only carries a date, not a timestamp).
fn parse_metadata_date(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&chrono::Utc));
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| chrono::DateTime::from_naive_utc_and_offset(dt, chrono::Utc))
}

fn passes_filters(row: &CandidateRow, filters: &SearchFilters) -> bool {
    if let Some(collection) = &filters.collection {
        if &row.collection_name != collection {
            return false;
        }
    }
    if let Some(collection_type) = filters.collection_type {
        if row.collection_type != collection_type {
            return false;
        }
    }
    if let Some(prefix) = &filters.path_prefix {
        if !row.path.starts_with(prefix.as_str()) {
            return false;
        }
    }
    if let Some(updated_after) = &filters.updated_after {
        if row.updated_at < updated_after.timestamp() {
            return false;
        }
    }
    if let Some(source_type) = &filters.source_type {
        if &row.source_type != source_type {
            return false;
        }
    }
    if let Some(sender) = &filters.sender {
        let matches = row
            .metadata
            .get("sender")
            .map(|s| s.to_lowercase().contains(&sender.to_lowercase()))
            .unwrap_or(false);
        if !matches {
            return false;
        }
    }
    if let Some(author) = &filters.author {
        let needle = author.to_lowercase();
        let matches = ["author", "authors"]
            .iter()
            .any(|key| row.metadata.get(*key).map(|v| v.to_lowercase().contains(&needle)).unwrap_or(false));
        if !matches {
            return false;
        }
    }
    if filters.date_from.is_some() || filters.date_to.is_some() {
        let Some(date) = row.metadata.get("date").and_then(|d| parse_metadata_date(d)) else {
            return false;
        };
        if let Some(from) = &filters.date_from {
            if date < *from {
                return false;
            }
        }
        if let Some(to) = &filters.date_to {
            if date > *to {
                return false;
            }
        }
    }
    true
}

/// A source is flagged stale when its file is newer on disk than the
/// `mtime` recorded at the time this chunk was indexed — the watcher has
/// seen the change (or will, once debounce fires) but the indexing queue
/// hasn't caught up yet. Only meaningful for absolute filesystem paths;
/// virtual paths (`calibre://`, message ids, feed guids) are never stale
/// by this check.
fn is_stale(row: &CandidateRow) -> bool {
    let Some(indexed_mtime) = row.source_mtime else {
        return false;
    };
    let path = std::path::Path::new(&row.path);
    if !path.is_absolute() {
        return false;
    }
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => match modified.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64 > indexed_mtime,
            Err(_) => false,
        },
        Err(_) => false,
    }
}

fn make_snippet(content: &str) -> String {
    const MAX: usize = 280;
    if content.len() <= MAX {
        content.to_string()
    } else {
        let mut end = MAX;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &content[..end])
    }
}

async fn fetch_lexical_candidates(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
) -> Result<Vec<CandidateRow>> {
    let rows = sqlx::query(
        r#"
        SELECT dc.id AS chunk_id, dc.source_id, dc.heading_path, dc.title, dc.content, dc.metadata, dc.updated_at,
               col.name AS collection_name, col.collection_type AS collection_type,
               s.path AS path, s.mtime AS source_mtime, s.source_type AS source_type
        FROM chunks_fts
        JOIN document_chunks dc ON dc.rowid = chunks_fts.rowid
        JOIN sources s ON s.id = dc.source_id
        JOIN collections col ON col.id = dc.collection_id
        WHERE chunks_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| row_to_candidate(row))
        .collect())
}

async fn fetch_dense_candidates(
    pool: &SqlitePool,
    query_vector: &[f32],
    limit: i64,
) -> Result<Vec<CandidateRow>> {
    let rows = sqlx::query(
        r#"
        SELECT dc.id AS chunk_id, dc.source_id, dc.heading_path, dc.title, dc.content, dc.metadata, dc.updated_at,
               col.name AS collection_name, col.collection_type AS collection_type,
               s.path AS path, s.mtime AS source_mtime, s.source_type AS source_type, cv.embedding AS embedding
        FROM chunk_vectors cv
        JOIN document_chunks dc ON dc.id = cv.chunk_id
        JOIN sources s ON s.id = dc.source_id
        JOIN collections col ON col.id = dc.collection_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<(f32, CandidateRow)> = Vec::with_capacity(rows.len());
    for row in rows {
        let blob: Vec<u8> = row.try_get("embedding").unwrap_or_default();
        let vector = embedding::blob_to_vec(&blob);
        let similarity = embedding::cosine_similarity(query_vector, &vector);
        if let Some(candidate) = row_to_candidate(row) {
            scored.push((similarity, candidate));
        }
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit.max(0) as usize);
    Ok(scored.into_iter().map(|(_, c)| c).collect())
}

fn row_to_candidate(row: sqlx::sqlite::SqliteRow) -> Option<CandidateRow> {
    let collection_type_str: String = row.try_get("collection_type").ok()?;
    let collection_type: CollectionType = collection_type_str.parse().ok()?;
    let metadata_json: Option<String> = row.try_get("metadata").ok();
    let metadata = metadata_json
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    Some(CandidateRow {
        chunk_id: row.try_get("chunk_id").ok()?,
        source_id: row.try_get("source_id").ok()?,
        collection_name: row.try_get("collection_name").ok()?,
        collection_type,
        source_type: row.try_get("source_type").ok().unwrap_or_default(),
        path: row.try_get("path").ok()?,
        heading_path: row.try_get("heading_path").ok(),
        title: row.try_get("title").ok(),
        content: row.try_get("content").ok()?,
        source_mtime: row.try_get("source_mtime").ok(),
        updated_at: row.try_get("updated_at").ok()?,
        metadata,
    })
}

/// Run a hybrid search and return up to `top_k` results, RRF-ranked and
/// filtered. `query` embeds through `config.embedding` when embeddings are
/// enabled; when disabled, the dense side of the fusion is simply empty and
/// results are lexical-only.
pub async fn hybrid_search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    top_k: i64,
    filters: &SearchFilters,
) -> Result<Vec<SearchResult>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let has_filters = filters.collection.is_some()
        || filters.collection_type.is_some()
        || filters.path_prefix.is_some()
        || filters.updated_after.is_some()
        || filters.source_type.is_some()
        || filters.sender.is_some()
        || filters.author.is_some()
        || filters.date_from.is_some()
        || filters.date_to.is_some();
    let oversample = if has_filters {
        OVERSAMPLE_FILTERED
    } else {
        OVERSAMPLE_UNFILTERED
    };
    let candidate_limit = top_k.saturating_mul(oversample).max(top_k);

    let lexical = fetch_lexical_candidates(pool, query, candidate_limit).await?;

    let dense = if config.embedding.is_enabled() {
        match embedding::create_provider(&config.embedding) {
            Ok(provider) => {
                match embedding::embed_query(provider.as_ref(), &config.embedding, query).await {
                    Ok(query_vector) => fetch_dense_candidates(pool, &query_vector, candidate_limit).await?,
                    Err(e) => {
                        tracing::warn!(error = %e, "query embedding failed, falling back to lexical-only");
                        Vec::new()
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding provider unavailable, falling back to lexical-only");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let rrf_k = config.search_defaults.rrf_k as f64;
    let vector_weight = config.search_defaults.vector_weight;
    let fts_weight = config.search_defaults.fts_weight;

    struct Fused {
        row: CandidateRow,
        score: f64,
        dense_rank: Option<usize>,
        lexical_rank: Option<usize>,
    }

    let mut fused: HashMap<String, Fused> = HashMap::new();

    for (rank, row) in dense.into_iter().enumerate() {
        let contribution = vector_weight / (rrf_k + rank as f64 + 1.0);
        fused
            .entry(row.chunk_id.clone())
            .and_modify(|f| {
                f.score += contribution;
                f.dense_rank = Some(rank);
            })
            .or_insert_with(|| Fused {
                row,
                score: contribution,
                dense_rank: Some(rank),
                lexical_rank: None,
            });
    }

    for (rank, row) in lexical.into_iter().enumerate() {
        let contribution = fts_weight / (rrf_k + rank as f64 + 1.0);
        fused
            .entry(row.chunk_id.clone())
            .and_modify(|f| {
                f.score += contribution;
                f.lexical_rank = Some(rank);
            })
            .or_insert_with(|| Fused {
                row,
                score: contribution,
                dense_rank: None,
                lexical_rank: Some(rank),
            });
    }

    let mut results: Vec<SearchResult> = fused
        .into_values()
        .filter(|f| passes_filters(&f.row, filters))
        .map(|f| SearchResult {
            chunk_id: f.row.chunk_id.clone(),
            source_id: f.row.source_id.clone(),
            collection_name: f.row.collection_name.clone(),
            collection_type: f.row.collection_type,
            source_type: f.row.source_type.clone(),
            path: f.row.path.clone(),
            heading_path: f.row.heading_path.clone().or_else(|| f.row.title.clone()),
            snippet: make_snippet(&f.row.content),
            score: f.score,
            dense_rank: f.dense_rank,
            lexical_rank: f.lexical_rank,
            stale: is_stale(&f.row),
            metadata: f.row.metadata.clone(),
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(top_k.max(0) as usize);

    Ok(results)
}

/// Derive the presentation URI for a search result, per `spec.md` §6:
/// vault files get a vault-open URI, code files an editor URI with a line
/// suffix (unavailable here since chunks don't carry line numbers, so the
/// suffix is omitted), other file-backed sources a `file://` URI, and
/// virtual source paths (git commits, calibre descriptions, email/RSS
/// ids) no URI at all since they aren't directly openable.
pub fn derive_source_uri(result: &SearchResult) -> Option<String> {
    if result.path.starts_with("git://")
        || result.path.starts_with("calibre://")
        || matches!(result.collection_type, CollectionType::Email | CollectionType::Rss)
    {
        return None;
    }
    match result.collection_type {
        CollectionType::Vault => Some(format!(
            "obsidian://open?vault={}&file={}",
            urlencoding_lite(&result.collection_name),
            urlencoding_lite(&result.path)
        )),
        CollectionType::Code => Some(format!("vscode://file/{}", result.path)),
        _ if std::path::Path::new(&result.path).is_absolute() => Some(format!("file://{}", result.path)),
        _ => None,
    }
}

/// Minimal percent-encoding for the handful of characters that show up in
/// vault names and relative paths; not a general-purpose URI encoder.
fn urlencoding_lite(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ' ' => "%20".to_string(),
            '&' => "%26".to_string(),
            c => c.to_string(),
        })
        .collect()
}

/// CLI entry point — runs [`hybrid_search`] and prints results to stdout.
pub async fn run_search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    top_k: i64,
    filters: &SearchFilters,
) -> Result<()> {
    let results = hybrid_search(pool, config, query, top_k, filters).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} / {}",
            i + 1,
            result.score,
            result.collection_name,
            result.path
        );
        if let Some(heading) = &result.heading_path {
            println!("    heading: {heading}");
        }
        if result.stale {
            println!("    (stale: source changed since last index)");
        }
        println!("    excerpt: \"{}\"", result.snippet.replace('\n', " ").trim());
        println!("    chunk: {}", result.chunk_id);
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexers::{get_or_create_collection, sync_items};
    use crate::models::SourceItem;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn test_config() -> Config {
        toml::from_str("[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n").unwrap()
    }

    #[tokio::test]
    async fn lexical_only_search_finds_matching_chunk() {
        let pool = memory_pool().await;
        let cache_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let cache = crate::convert_cache::ConvertCache::open(cache_pool).await.unwrap();
        let config = test_config();

        let collection_id = get_or_create_collection(&pool, "notes", CollectionType::Vault, None)
            .await
            .unwrap();
        let item = SourceItem {
            collection_name: "notes".to_string(),
            collection_type: CollectionType::Vault,
            path: "zettelkasten.md".to_string(),
            title: None,
            content_type: "text/markdown".to_string(),
            source_type: "markdown".to_string(),
            body: "the quick brown fox jumps over the lazy dog".to_string(),
            raw_bytes: None,
            mtime: None,
            size: None,
            metadata: Default::default(),
            pre_chunked: None,
        };
        sync_items(&config, &pool, &cache, &collection_id, vec![item], None, false)
            .await
            .unwrap();

        let filters = SearchFilters::default();
        let results = hybrid_search(&pool, &config, "fox", 10, &filters).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "zettelkasten.md");
        assert_eq!(results[0].lexical_rank, Some(0));
        assert_eq!(results[0].dense_rank, None);
    }

    #[tokio::test]
    async fn empty_query_returns_no_results() {
        let pool = memory_pool().await;
        let config = test_config();
        let results = hybrid_search(&pool, &config, "   ", 10, &SearchFilters::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn collection_filter_excludes_other_collections() {
        let pool = memory_pool().await;
        let cache_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let cache = crate::convert_cache::ConvertCache::open(cache_pool).await.unwrap();
        let config = test_config();

        let notes_id = get_or_create_collection(&pool, "notes", CollectionType::Vault, None)
            .await
            .unwrap();
        let code_id = get_or_create_collection(&pool, "myrepo", CollectionType::Code, None)
            .await
            .unwrap();

        let mk = |name: &str, path: &str| SourceItem {
            collection_name: name.to_string(),
            collection_type: CollectionType::Vault,
            path: path.to_string(),
            title: None,
            content_type: "text/plain".to_string(),
            source_type: "text".to_string(),
            body: "needle in a haystack".to_string(),
            raw_bytes: None,
            mtime: None,
            size: None,
            metadata: Default::default(),
            pre_chunked: None,
        };
        sync_items(&config, &pool, &cache, &notes_id, vec![mk("notes", "a.md")], None, false)
            .await
            .unwrap();
        sync_items(&config, &pool, &cache, &code_id, vec![mk("myrepo", "b.rs")], None, false)
            .await
            .unwrap();

        let mut filters = SearchFilters::default();
        filters.collection = Some("myrepo".to_string());
        let results = hybrid_search(&pool, &config, "needle", 10, &filters).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "b.rs");
    }
}
