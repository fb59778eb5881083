//! Indexer dispatch and the shared chunk/embed/store skeleton every
//! source-specific indexer (project, git, vault, calibre, email, rss)
//! builds on.
//!
//! Each indexer's job is to discover [`SourceItem`]s and hand them to
//! [`sync_items`], which does the work common to all of them: compute a
//! content hash, skip sources whose hash hasn't changed, binary-convert
//! through the shared [`ConvertCache`] when needed, chunk, embed inline
//! (best-effort), write `sources`/`document_chunks`/`chunk_vectors`, and
//! delete sources that disappeared since the last pass.

pub mod calibre;
pub mod code_blocks;
pub mod email;
pub mod git;
pub mod project;
pub mod rss;
pub mod vault;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::embedding::{self, vec_to_blob};
use crate::error::{HarnessError, Result};
use crate::models::{CollectionType, IndexResult, SourceItem, SourceStatus};

/// Route a collection name to the indexer that owns it, per the
/// configuration shape described in [`crate::config::Config`].
pub async fn dispatch(
    config: &Config,
    pool: &SqlitePool,
    convert_cache: &ConvertCache,
    collection: &str,
    force: bool,
) -> Result<IndexResult> {
    match collection {
        "obsidian" => vault::run(config, pool, convert_cache, force).await,
        "calibre" => calibre::run(config, pool, convert_cache, force).await,
        "email" => email::run(config, pool, convert_cache, force).await,
        "rss" => rss::run(config, pool, convert_cache, force).await,
        other if config.code_groups.contains_key(other) => {
            git::run(config, pool, convert_cache, other, force).await
        }
        other if config.projects.contains_key(other) => {
            project::run(config, pool, convert_cache, other, force).await
        }
        "home" | "global" if config.home.is_some() || !config.global_paths.is_empty() => {
            project::run_home_and_global(config, pool, convert_cache, force).await
        }
        other => Err(HarnessError::Other(anyhow::anyhow!(
            "unknown collection: {other}"
        ))),
    }
}

/// Reindex every collection the configuration enables, merging their
/// results into one summary.
pub async fn dispatch_all(
    config: &Config,
    pool: &SqlitePool,
    convert_cache: &ConvertCache,
    force: bool,
) -> Result<IndexResult> {
    let mut combined = IndexResult::default();

    if config.home.is_some() || !config.global_paths.is_empty() {
        combined.merge(project::run_home_and_global(config, pool, convert_cache, force).await?);
    }
    for name in config.projects.keys() {
        combined.merge(project::run(config, pool, convert_cache, name, force).await?);
    }
    if config.is_collection_enabled("obsidian") {
        combined.merge(vault::run(config, pool, convert_cache, force).await?);
    }
    for name in config.code_groups.keys() {
        combined.merge(git::run(config, pool, convert_cache, name, force).await?);
    }
    if config.is_collection_enabled("calibre") {
        combined.merge(calibre::run(config, pool, convert_cache, force).await?);
    }
    if config.is_collection_enabled("email") {
        combined.merge(email::run(config, pool, convert_cache, force).await?);
    }
    if config.is_collection_enabled("rss") {
        combined.merge(rss::run(config, pool, convert_cache, force).await?);
    }

    Ok(combined)
}

pub async fn get_or_create_collection(
    pool: &SqlitePool,
    name: &str,
    collection_type: CollectionType,
    description: Option<&str>,
) -> Result<String> {
    if let Some(id) = sqlx::query_scalar::<_, String>("SELECT id FROM collections WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO collections(id, name, collection_type, description, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(collection_type.as_str())
    .bind(description)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(id)
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of the chunking parameters a conversion was produced under, so a
/// changed `max_tokens`/`overlap_words` invalidates the convert cache even
/// when the source bytes haven't changed.
pub(crate) fn config_hash(config: &Config) -> String {
    hash_bytes(format!("{}:{}", config.chunking.max_tokens, config.chunking.overlap_words).as_bytes())
}

/// Extract plain text from a PDF's raw bytes. Best-effort: malformed PDFs
/// yield an empty string rather than failing the whole source.
pub(crate) fn pdf_to_text(bytes: &[u8]) -> anyhow::Result<String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| anyhow::anyhow!("pdf extraction failed: {e}"))
}

/// Extract plain text from an EPUB's raw bytes by concatenating the text
/// nodes of every XHTML/HTML entry in the zip, in archive order.
pub(crate) fn epub_to_text(bytes: &[u8]) -> anyhow::Result<String> {
    use quick_xml::events::Event;
    use quick_xml::Reader;
    use std::io::{Cursor, Read};

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut out = String::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_lowercase();
        if !(name.ends_with(".xhtml") || name.ends_with(".html") || name.ends_with(".htm")) {
            continue;
        }
        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        drop(entry);

        let mut reader = Reader::from_str(&content);
        reader.config_mut().trim_text(true);
        loop {
            match reader.read_event() {
                Ok(Event::Text(t)) => {
                    if let Ok(text) = t.unescape() {
                        out.push_str(&text);
                        out.push(' ');
                    }
                }
                Ok(Event::Eof) => break,
                Err(_) => break,
                _ => {}
            }
        }
        out.push_str("\n\n");
    }

    Ok(out)
}

/// Resolve a [`SourceItem`]'s final body text, running binary containers
/// through the shared conversion cache.
pub(crate) async fn resolve_body(
    convert_cache: &ConvertCache,
    config_hash: &str,
    item: &SourceItem,
) -> Result<String> {
    match &item.raw_bytes {
        None => Ok(item.body.clone()),
        Some(bytes) => {
            let content_hash = hash_bytes(bytes);
            let content_type = item.content_type.clone();
            let bytes = bytes.clone();
            convert_cache
                .get_or_convert(&item.path, &content_hash, config_hash, move || match content_type.as_str() {
                    "application/pdf" => pdf_to_text(&bytes),
                    "application/epub+zip" => epub_to_text(&bytes),
                    other => anyhow::bail!("no converter registered for content type {other}"),
                })
                .await
        }
    }
}

/// Convert an arbitrary file on disk to markdown/plain text, used by the
/// `rag_convert` tool endpoint (`spec.md` §6) independently of the
/// indexing pipeline. Dispatches on extension the same way [`resolve_body`]
/// dispatches on `content_type`, and shares the same conversion cache so a
/// file already indexed doesn't get converted twice.
pub async fn convert_path_to_markdown(
    convert_cache: &ConvertCache,
    config: &Config,
    path: &std::path::Path,
) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let content_hash = hash_bytes(&bytes);
    let cfg_hash = config_hash(config);
    let source_path = path.to_string_lossy().to_string();

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    convert_cache
        .get_or_convert(&source_path, &content_hash, &cfg_hash, move || match extension.as_str() {
            "pdf" => pdf_to_text(&bytes),
            "epub" => epub_to_text(&bytes),
            _ => String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("not valid utf-8 text: {e}")),
        })
        .await
}

/// Chunk, embed (best-effort), and store `items` under `collection_id`,
/// then delete any previously-indexed source whose path is not present in
/// `items` this pass. `prune_scope`, when set, restricts both the
/// "existing sources" comparison set and the prune-on-disappearance delete
/// to paths starting with that prefix — so a collection that aggregates
/// several independent sub-sources (several git repos in one code group,
/// several delegated vaults in one project) can sync one sub-source at a
/// time without the others' sources being wrongly pruned. `force` bypasses
/// the unchanged-content-hash skip, reprocessing every item regardless of
/// whether its hash matches what's already stored.
pub async fn sync_items(
    config: &Config,
    pool: &SqlitePool,
    convert_cache: &ConvertCache,
    collection_id: &str,
    items: Vec<SourceItem>,
    prune_scope: Option<&str>,
    force: bool,
) -> Result<IndexResult> {
    let cfg_hash = config_hash(config);
    let mut result = IndexResult::default();
    let mut seen_paths: HashSet<String> = HashSet::new();

    let existing: Vec<(String, String)> = match prune_scope {
        Some(scope) => {
            sqlx::query_as("SELECT path, content_hash FROM sources WHERE collection_id = ? AND path LIKE ? ESCAPE '\\'")
                .bind(collection_id)
                .bind(format!("{}%", like_escape(scope)))
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT path, content_hash FROM sources WHERE collection_id = ?")
                .bind(collection_id)
                .fetch_all(pool)
                .await?
        }
    };
    let existing_hashes: std::collections::HashMap<String, String> = existing.into_iter().collect();

    for item in items {
        result.sources_seen += 1;
        seen_paths.insert(item.path.clone());

        let body = match resolve_body(convert_cache, &cfg_hash, &item).await {
            Ok(b) => b,
            Err(e) => {
                result.errors.push(format!("{}: {e}", item.path));
                mark_source_error(pool, collection_id, &item.path, &e.to_string()).await?;
                continue;
            }
        };

        let content_hash = hash_bytes(body.as_bytes());

        if !force && existing_hashes.get(&item.path) == Some(&content_hash) {
            result.sources_skipped_unchanged += 1;
            continue;
        }

        match index_one_source(config, pool, collection_id, &item, &body, &content_hash).await {
            Ok((chunks_written, chunks_embedded)) => {
                result.sources_indexed += 1;
                result.chunks_written += chunks_written;
                result.chunks_embedded += chunks_embedded;
            }
            Err(e) => {
                result.errors.push(format!("{}: {e}", item.path));
                mark_source_error(pool, collection_id, &item.path, &e.to_string()).await?;
            }
        }
    }

    let stale_paths: Vec<String> = existing_hashes
        .keys()
        .filter(|p| !seen_paths.contains(*p))
        .cloned()
        .collect();

    for path in stale_paths {
        sqlx::query("DELETE FROM sources WHERE collection_id = ? AND path = ?")
            .bind(collection_id)
            .bind(&path)
            .execute(pool)
            .await?;
        result.sources_deleted += 1;
    }

    Ok(result)
}

/// Escape `%`/`_`/`\` for use inside a `LIKE ... ESCAPE '\'` pattern.
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

async fn mark_source_error(
    pool: &SqlitePool,
    collection_id: &str,
    path: &str,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sources(id, collection_id, path, content_hash, indexed_at, status, error) \
         VALUES (?, ?, ?, '', ?, 'error', ?) \
         ON CONFLICT(collection_id, path) DO UPDATE SET status = 'error', error = excluded.error, indexed_at = excluded.indexed_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(collection_id)
    .bind(path)
    .bind(Utc::now().timestamp())
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

async fn index_one_source(
    config: &Config,
    pool: &SqlitePool,
    collection_id: &str,
    item: &SourceItem,
    body: &str,
    content_hash: &str,
) -> Result<(u64, u64)> {
    let source_id: String = sqlx::query_scalar("SELECT id FROM sources WHERE collection_id = ? AND path = ?")
        .bind(collection_id)
        .bind(&item.path)
        .fetch_optional(pool)
        .await?
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let now = Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO sources(id, collection_id, path, source_type, content_hash, mtime, size, indexed_at, status, error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'indexed', NULL) \
         ON CONFLICT(collection_id, path) DO UPDATE SET \
            source_type = excluded.source_type, content_hash = excluded.content_hash, mtime = excluded.mtime, size = excluded.size, \
            indexed_at = excluded.indexed_at, status = 'indexed', error = NULL",
    )
    .bind(&source_id)
    .bind(collection_id)
    .bind(&item.path)
    .bind(&item.source_type)
    .bind(content_hash)
    .bind(item.mtime)
    .bind(item.size)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query("DELETE FROM document_chunks WHERE source_id = ?")
        .bind(&source_id)
        .execute(pool)
        .await?;

    let pieces = match &item.pre_chunked {
        Some(pieces) => pieces.clone(),
        None => chunk_text(body, config.chunking.max_tokens, config.chunking.overlap_words),
    };
    let metadata_json = serde_json::to_string(&item.metadata).unwrap_or_else(|_| "{}".to_string());
    let mut chunk_ids = Vec::with_capacity(pieces.len());

    for piece in &pieces {
        let chunk_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO document_chunks(id, source_id, collection_id, chunk_index, heading_path, title, content, token_count, content_hash, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(&source_id)
        .bind(collection_id)
        .bind(piece.chunk_index)
        .bind(&piece.heading_path)
        .bind(&item.title)
        .bind(&piece.content)
        .bind(piece.token_count)
        .bind(&piece.content_hash)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
        chunk_ids.push((chunk_id, piece.content_hash.clone()));
    }

    let chunks_written = chunk_ids.len() as u64;
    let mut chunks_embedded = 0u64;

    if config.embedding.is_enabled() && !chunk_ids.is_empty() {
        let texts: Vec<String> = pieces.iter().map(|p| p.content.clone()).collect();
        match embedding::embed_texts_with_fallback(&config.embedding, &texts).await {
            Ok(embedded) => {
                for (idx, vector) in embedded {
                    let (chunk_id, content_hash) = &chunk_ids[idx];
                    let blob = vec_to_blob(&vector);
                    sqlx::query(
                        "INSERT INTO chunk_vectors(chunk_id, model, dims, embedding, content_hash, created_at) \
                         VALUES (?, ?, ?, ?, ?, ?) \
                         ON CONFLICT(chunk_id) DO UPDATE SET embedding = excluded.embedding, content_hash = excluded.content_hash",
                    )
                    .bind(chunk_id)
                    .bind(config.embedding.model.as_deref().unwrap_or(""))
                    .bind(vector.len() as i64)
                    .bind(blob)
                    .bind(content_hash)
                    .bind(now)
                    .execute(pool)
                    .await?;
                    chunks_embedded += 1;
                }
            }
            Err(HarnessError::EmbeddingUnreachable(msg)) => {
                tracing::warn!(error = %msg, "embedding service unreachable, leaving chunks pending");
            }
            Err(e) => return Err(e),
        }
    }

    Ok((chunks_written, chunks_embedded))
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[tokio::test]
    async fn get_or_create_collection_is_idempotent() {
        let pool = memory_pool().await;
        let a = get_or_create_collection(&pool, "notes", CollectionType::Vault, None)
            .await
            .unwrap();
        let b = get_or_create_collection(&pool, "notes", CollectionType::Vault, None)
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn sync_items_skips_unchanged_and_deletes_removed() {
        let pool = memory_pool().await;
        let shared = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let cache = ConvertCache::open(shared).await.unwrap();
        let config: Config = toml::from_str(
            "[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n",
        )
        .unwrap();
        let collection_id = get_or_create_collection(&pool, "notes", CollectionType::Vault, None)
            .await
            .unwrap();

        let item = |path: &str, body: &str| SourceItem {
            collection_name: "notes".to_string(),
            collection_type: CollectionType::Vault,
            path: path.to_string(),
            title: None,
            content_type: "text/markdown".to_string(),
            source_type: "markdown".to_string(),
            body: body.to_string(),
            raw_bytes: None,
            mtime: None,
            size: None,
            metadata: Default::default(),
            pre_chunked: None,
        };

        let r1 = sync_items(&config, &pool, &cache, &collection_id, vec![item("a.md", "hello")], None, false)
            .await
            .unwrap();
        assert_eq!(r1.sources_indexed, 1);

        let r2 = sync_items(&config, &pool, &cache, &collection_id, vec![item("a.md", "hello")], None, false)
            .await
            .unwrap();
        assert_eq!(r2.sources_skipped_unchanged, 1);
        assert_eq!(r2.sources_indexed, 0);

        let r3 = sync_items(&config, &pool, &cache, &collection_id, vec![item("a.md", "hello")], None, true)
            .await
            .unwrap();
        assert_eq!(r3.sources_skipped_unchanged, 0);
        assert_eq!(r3.sources_indexed, 1, "force=true must bypass the unchanged-hash skip");

        let r4 = sync_items(&config, &pool, &cache, &collection_id, vec![], None, false)
            .await
            .unwrap();
        assert_eq!(r4.sources_deleted, 1);
    }
}
