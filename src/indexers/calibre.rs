//! Calibre ebook-library indexer.
//!
//! Each configured library becomes its own `calibre`-typed collection.
//! Calibre libraries are a directory of `Author/Title (id)/` folders each
//! holding a `metadata.opf` (title/authors/tags/series/rating/publisher)
//! and the book file itself (epub/pdf). Source paths are the virtual URI
//! `calibre://<library>/<relative-book-path>`.
//!
//! When a book's file hash is unchanged but its `metadata.opf` drift
//! (author/tags/series/rating/publisher changed), this indexer updates
//! the stored `metadata` JSON on the existing document rows without
//! re-chunking or re-embedding — a metadata-only refresh.

use std::collections::HashMap;
use std::path::Path;

use walkdir::WalkDir;

use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::error::Result;
use crate::indexers::{config_hash, get_or_create_collection, hash_bytes, resolve_body, sync_items};
use crate::models::{CollectionType, IndexResult, SourceItem};

pub async fn run(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    force: bool,
) -> Result<IndexResult> {
    let mut combined = IndexResult::default();

    for library_path in &config.calibre_libraries {
        if !library_path.exists() {
            combined
                .errors
                .push(format!("calibre library does not exist: {}", library_path.display()));
            continue;
        }

        let name = library_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| library_path.to_string_lossy().to_string());

        let collection_id = get_or_create_collection(
            pool,
            &format!("calibre-{name}"),
            CollectionType::Calibre,
            Some("calibre-library"),
        )
        .await?;

        let items = discover(&name, library_path)?;
        if !force {
            refresh_metadata_only(pool, convert_cache, config, &collection_id, &items).await?;
        }
        combined.merge(sync_items(config, pool, convert_cache, &collection_id, items, None, force).await?);
    }

    Ok(combined)
}

/// Minimal `metadata.opf` field extraction. Calibre's OPF is an XML/RDF
/// document; rather than pull in a full OPF parser we only care about a
/// handful of `<dc:*>` and `<meta name="calibre:*">` fields, extracted by
/// simple tag-delimited scanning (matching the original's own
/// lightweight regex-based OPF reader).
fn parse_opf_fields(opf: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for (tag, key) in [
        ("dc:title", "title"),
        ("dc:creator", "authors"),
        ("dc:publisher", "publisher"),
    ] {
        if let Some(v) = extract_between(opf, &format!("<{tag}"), &format!("</{tag}>")) {
            fields.insert(key.to_string(), v);
        }
    }
    if let Some(series) = extract_meta_content(opf, "calibre:series") {
        fields.insert("series".to_string(), series);
    }
    if let Some(rating) = extract_meta_content(opf, "calibre:rating") {
        fields.insert("rating".to_string(), rating);
    }
    let tags: Vec<String> = opf
        .match_indices("<dc:subject")
        .filter_map(|(i, _)| extract_between(&opf[i..], ">", "</dc:subject>"))
        .collect();
    if !tags.is_empty() {
        fields.insert("tags".to_string(), tags.join(","));
    }
    fields
}

fn extract_between(haystack: &str, open: &str, close: &str) -> Option<String> {
    let start = haystack.find(open)? + open.len();
    let after_open = &haystack[start..];
    let tag_end = after_open.find('>')? + 1;
    let body_start = &after_open[tag_end..];
    let end = body_start.find(close)?;
    Some(body_start[..end].trim().to_string())
}

fn extract_meta_content(haystack: &str, name: &str) -> Option<String> {
    let marker = format!("name=\"{name}\"");
    let idx = haystack.find(&marker)?;
    let tail = &haystack[idx..];
    let content_key = "content=\"";
    let content_start = tail.find(content_key)? + content_key.len();
    let tail = &tail[content_start..];
    let content_end = tail.find('"')?;
    Some(tail[..content_end].to_string())
}

fn discover(collection_name: &str, library_path: &Path) -> Result<Vec<SourceItem>> {
    let mut items = Vec::new();

    for entry in WalkDir::new(library_path).min_depth(2).max_depth(2) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let book_dir = entry.path();
        let opf_path = book_dir.join("metadata.opf");
        if !opf_path.exists() {
            continue;
        }
        let opf = std::fs::read_to_string(&opf_path).unwrap_or_default();
        let fields = parse_opf_fields(&opf);

        let book_file = WalkDir::new(book_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| {
                e.file_type().is_file()
                    && matches!(
                        e.path().extension().and_then(|x| x.to_str()),
                        Some("epub") | Some("pdf")
                    )
            });

        let Some(book_file) = book_file else { continue };
        let relative = book_file
            .path()
            .strip_prefix(library_path)
            .unwrap_or(book_file.path())
            .to_string_lossy()
            .to_string();

        let metadata = std::fs::metadata(book_file.path())?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        let is_epub = book_file.path().extension().and_then(|e| e.to_str()) == Some("epub");
        let bytes = std::fs::read(book_file.path())?;

        items.push(SourceItem {
            collection_name: collection_name.to_string(),
            collection_type: CollectionType::Calibre,
            path: format!("calibre://{collection_name}/{relative}"),
            title: fields.get("title").cloned(),
            content_type: if is_epub {
                "application/epub+zip".to_string()
            } else {
                "application/pdf".to_string()
            },
            source_type: "book".to_string(),
            body: String::new(),
            raw_bytes: Some(bytes),
            mtime,
            size: Some(metadata.len() as i64),
            metadata: fields,
            pre_chunked: None,
        });
    }

    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

/// Update the stored `title`/`metadata` on a book's existing chunks when
/// its OPF-derived fields drifted but the book file itself didn't — so
/// `sync_items`'s unchanged-content-hash skip (which leaves those chunks
/// alone) doesn't leave a stale series/tags/rating/author behind. Recomputes
/// each item's body hash the same way `sync_items` will (through the shared
/// convert cache, so this doesn't re-run PDF/EPUB extraction on a cache
/// hit) and only touches sources whose hash still matches what's on record;
/// anything whose hash changed is left for `sync_items` to fully reindex.
async fn refresh_metadata_only(
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    config: &Config,
    collection_id: &str,
    items: &[SourceItem],
) -> Result<()> {
    let cfg_hash = config_hash(config);

    for item in items {
        let existing: Option<(String, String)> =
            sqlx::query_as("SELECT id, content_hash FROM sources WHERE collection_id = ? AND path = ?")
                .bind(collection_id)
                .bind(&item.path)
                .fetch_optional(pool)
                .await?;
        let Some((source_id, existing_hash)) = existing else {
            continue;
        };

        let body = match resolve_body(convert_cache, &cfg_hash, item).await {
            Ok(b) => b,
            Err(_) => continue,
        };
        if hash_bytes(body.as_bytes()) != existing_hash {
            continue;
        }

        let metadata_json = serde_json::to_string(&item.metadata).unwrap_or_else(|_| "{}".to_string());
        sqlx::query("UPDATE document_chunks SET title = ?, metadata = ?, updated_at = ? WHERE source_id = ?")
            .bind(&item.title)
            .bind(&metadata_json)
            .bind(chrono::Utc::now().timestamp())
            .bind(&source_id)
            .execute(pool)
            .await?;
    }

    Ok(())
}
