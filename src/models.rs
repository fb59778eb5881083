//! Core data models shared across the index store, indexing pipeline, and
//! search engine.
//!
//! A [`Collection`] groups [`Source`]s (one per indexed file/mailbox
//! item/feed entry); each `Source` is chunked into one or more
//! [`DocumentChunk`] rows, which is the unit actually embedded, stored in
//! the FTS5 index, and returned from search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    Project,
    Vault,
    Code,
    Calibre,
    Email,
    Rss,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Project => "project",
            CollectionType::Vault => "vault",
            CollectionType::Code => "code",
            CollectionType::Calibre => "calibre",
            CollectionType::Email => "email",
            CollectionType::Rss => "rss",
        }
    }
}

impl std::str::FromStr for CollectionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(CollectionType::Project),
            "vault" => Ok(CollectionType::Vault),
            "code" => Ok(CollectionType::Code),
            "calibre" => Ok(CollectionType::Calibre),
            "email" => Ok(CollectionType::Email),
            "rss" => Ok(CollectionType::Rss),
            other => anyhow::bail!("unknown collection type: {other}"),
        }
    }
}

/// A named, typed grouping of sources (a git repo, an Obsidian vault, a
/// calibre library, a mailbox, a feed store, or an ad-hoc project folder).
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub collection_type: CollectionType,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Indexing state of one unit of source material: a file, a git commit,
/// a book, an email, or a feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Indexed,
    Stale,
    Error,
}

/// A single unit of source material tracked for incremental re-indexing.
/// `content_hash` and `mtime`/`size` together decide whether a source needs
/// to be re-chunked on the next pass.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub collection_id: String,
    /// Stable identifier within the collection: a filesystem path, a git
    /// blob path at a commit, a calibre book id, a message-id, or a feed
    /// entry guid.
    pub path: String,
    pub content_hash: String,
    pub mtime: Option<i64>,
    pub size: Option<i64>,
    pub indexed_at: DateTime<Utc>,
    pub status: SourceStatus,
    pub error: Option<String>,
}

/// Raw item produced by an indexer before chunking. This is the connector
/// boundary: filesystem/git/vault/calibre/email/rss indexers all normalize
/// to this shape before the shared chunker and embedder take over.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub collection_name: String,
    pub collection_type: CollectionType,
    pub path: String,
    pub title: Option<String>,
    pub content_type: String,
    /// A finer-grained label than `collection_type` surfaced to search
    /// filters and results (e.g. "markdown", "commit", "source-file",
    /// "book", "email", "rss-article") — `collection_type` says which
    /// indexer owns the source, this says what kind of thing it is.
    pub source_type: String,
    pub body: String,
    /// Set instead of `body` for binary containers (PDF/EPUB) that need a
    /// conversion pass through [`crate::convert_cache`] before chunking.
    pub raw_bytes: Option<Vec<u8>>,
    pub mtime: Option<i64>,
    pub size: Option<i64>,
    pub metadata: HashMap<String, String>,
    /// Pre-split chunk pieces, bypassing the shared paragraph-boundary
    /// chunker. Used by indexers (git's structural code splitter) whose
    /// notion of a chunk boundary isn't paragraphs.
    pub pre_chunked: Option<Vec<crate::chunk::ChunkPiece>>,
}

/// One chunk of a source's body text: the unit that is embedded, stored
/// in the FTS5 virtual table, and returned from search.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub source_id: String,
    pub collection_id: String,
    pub chunk_index: i64,
    /// Markdown heading breadcrumb ("# Title > ## Section") or a code
    /// chunk's enclosing symbol path, when the chunker can determine one.
    pub heading_path: Option<String>,
    /// The source's title, denormalized onto every chunk so the lexical
    /// index can match against it directly rather than joining `sources`.
    pub title: Option<String>,
    pub content: String,
    pub token_count: i64,
    pub content_hash: String,
    /// The source item's metadata (sender, author, dates, tags, ...),
    /// denormalized onto every chunk so search filters don't need a join.
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A search hit after reciprocal-rank fusion, with collection/source
/// context attached for presentation and path translation.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub source_id: String,
    pub collection_name: String,
    pub collection_type: CollectionType,
    pub source_type: String,
    pub path: String,
    pub heading_path: Option<String>,
    pub snippet: String,
    pub score: f64,
    pub dense_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
    /// True when the source's on-disk content hash no longer matches the
    /// hash this chunk was embedded from (indexing is lagging the watcher).
    pub stale: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    pub collection: Option<String>,
    pub collection_type: Option<CollectionType>,
    pub path_prefix: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
    /// Matches `SourceItem::source_type` (e.g. "commit", "book", "email").
    pub source_type: Option<String>,
    /// Case-insensitive substring match against metadata `sender` (email).
    pub sender: Option<String>,
    /// Case-insensitive substring match against metadata `author`/`authors`
    /// (git commits, calibre books).
    pub author: Option<String>,
    /// Inclusive lower bound on a metadata `date` field, compared as RFC
    /// 3339 strings.
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on a metadata `date` field.
    pub date_to: Option<DateTime<Utc>>,
}

/// What an indexing job should (re)index. Every variant carries `force`:
/// when true, `sync_items` (and git's HEAD-SHA watermark) skip their
/// unchanged-content short-circuits and reprocess everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRequest {
    /// Reindex a single named collection end to end.
    Collection { name: String, force: bool },
    /// Reindex every configured collection.
    All { force: bool },
    /// Reembed/rechunk a single already-discovered source path within a
    /// collection, used by the filesystem watcher for single-file changes.
    Source {
        collection: String,
        path: String,
        force: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexingStatus {
    Queued,
    Running,
    Done,
    Failed(String),
}

/// A unit of work submitted to the single-writer [`crate::queue::IndexingQueue`].
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub id: String,
    pub request: IndexRequest,
    pub status: IndexingStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of running one indexer to completion, returned to callers of
/// `submit_and_wait` and logged by the queue worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexResult {
    pub collection: String,
    pub sources_seen: u64,
    pub sources_indexed: u64,
    pub sources_skipped_unchanged: u64,
    pub sources_deleted: u64,
    pub chunks_written: u64,
    pub chunks_embedded: u64,
    pub errors: Vec<String>,
}

impl IndexResult {
    pub fn merge(&mut self, other: IndexResult) {
        self.sources_seen += other.sources_seen;
        self.sources_indexed += other.sources_indexed;
        self.sources_skipped_unchanged += other.sources_skipped_unchanged;
        self.sources_deleted += other.sources_deleted;
        self.chunks_written += other.chunks_written;
        self.chunks_embedded += other.chunks_embedded;
        self.errors.extend(other.errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_type_round_trips_through_str() {
        for ty in [
            CollectionType::Project,
            CollectionType::Vault,
            CollectionType::Code,
            CollectionType::Calibre,
            CollectionType::Email,
            CollectionType::Rss,
        ] {
            let parsed: CollectionType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, ty);
        }
    }

    #[test]
    fn index_result_merge_sums_counts_and_concatenates_errors() {
        let mut a = IndexResult {
            sources_seen: 2,
            chunks_written: 5,
            errors: vec!["a".to_string()],
            ..Default::default()
        };
        let b = IndexResult {
            sources_seen: 3,
            chunks_written: 1,
            errors: vec!["b".to_string()],
            ..Default::default()
        };
        a.merge(b);
        assert_eq!(a.sources_seen, 5);
        assert_eq!(a.chunks_written, 6);
        assert_eq!(a.errors, vec!["a".to_string(), "b".to_string()]);
    }
}
