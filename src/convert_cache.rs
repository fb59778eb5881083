//! Content-addressed conversion cache (`spec.md` §4.1).
//!
//! Converting a PDF, EPUB, or other binary container format to plain text
//! is expensive and its result depends only on the file's bytes and the
//! converter's own configuration (e.g. OCR on/off). This store memoizes
//! conversions keyed on `(source_path, content_hash, config_hash)` in a
//! database shared across every group on the host, so the same book or
//! PDF attached to two different collections is only ever converted once.
//!
//! Grounded in the original's `doc_store.py::DocStore` — `get_or_convert`
//! (hash-then-lookup-then-convert), `get_document`, `invalidate`, and
//! `list_sources` — built on the teacher's `db.rs`/`migrate.rs` `sqlx`/WAL
//! connection idiom.
//!
//! Two concurrency properties hold:
//! - **Cross-process**: callers on different hosts/processes sharing this
//!   file never corrupt state, because the write transaction that records
//!   a conversion is short and the insert is idempotent (`ON CONFLICT`).
//! - **Within-process**: concurrent callers racing to convert the same
//!   `(source_path, content_hash, config_hash)` converge on a single
//!   converter invocation, enforced by an in-memory per-key async mutex
//!   (the converter itself never runs while a write transaction is held —
//!   it runs before the transaction opens, per `spec.md` §4.1).

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{HarnessError, Result};

/// Snapshot of one tracked source, as returned by [`ConvertCache::list_sources`].
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub source_path: String,
    pub content_hash: String,
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub discovered_at: i64,
}

pub struct ConvertCache {
    pool: SqlitePool,
    in_flight: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

fn key_of(source_path: &str, content_hash: &str, config_hash: &str) -> String {
    format!("{source_path}\u{1e}{content_hash}\u{1e}{config_hash}")
}

impl ConvertCache {
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversion_sources (
                source_path TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                size INTEGER,
                mtime INTEGER,
                discovered_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS converted_documents (
                source_path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                config_hash TEXT NOT NULL,
                document TEXT NOT NULL,
                format TEXT,
                converted_at INTEGER NOT NULL,
                PRIMARY KEY (source_path, content_hash, config_hash)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        migrate_config_hash_column(&pool).await?;

        Ok(Self {
            pool,
            in_flight: StdMutex::new(HashMap::new()),
        })
    }

    async fn lookup(&self, source_path: &str, content_hash: &str, config_hash: &str) -> Result<Option<String>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT document FROM converted_documents WHERE source_path = ? AND content_hash = ? AND config_hash = ?",
        )
        .bind(source_path)
        .bind(content_hash)
        .bind(config_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut guard = self.in_flight.lock().unwrap();
        guard.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Return the cached conversion for `(source_path, content_hash,
    /// config_hash)`, or run `convert` and cache its result. `convert` runs
    /// outside any DB write transaction so a long conversion (OCR,
    /// transcription) never blocks other writers against this store.
    pub async fn get_or_convert<F>(
        &self,
        source_path: &str,
        content_hash: &str,
        config_hash: &str,
        convert: F,
    ) -> Result<String>
    where
        F: FnOnce() -> anyhow::Result<String>,
    {
        if let Some(cached) = self.lookup(source_path, content_hash, config_hash).await? {
            return Ok(cached);
        }

        let key = key_of(source_path, content_hash, config_hash);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Re-check: another caller may have finished the conversion while
        // we waited for the lock.
        if let Some(cached) = self.lookup(source_path, content_hash, config_hash).await? {
            return Ok(cached);
        }

        let document = convert().map_err(|source| HarnessError::ConverterFailed {
            path: source_path.to_string(),
            source,
        })?;

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversion_sources(source_path, content_hash, size, mtime, discovered_at) \
             VALUES (?, ?, NULL, NULL, ?) \
             ON CONFLICT(source_path) DO UPDATE SET content_hash = excluded.content_hash",
        )
        .bind(source_path)
        .bind(content_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM converted_documents WHERE source_path = ? AND (content_hash != ? OR config_hash != ?)")
            .bind(source_path)
            .bind(content_hash)
            .bind(config_hash)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO converted_documents(source_path, content_hash, config_hash, document, format, converted_at) \
             VALUES (?, ?, ?, ?, NULL, ?) \
             ON CONFLICT(source_path, content_hash, config_hash) DO UPDATE SET document = excluded.document",
        )
        .bind(source_path)
        .bind(content_hash)
        .bind(config_hash)
        .bind(&document)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.in_flight.lock().unwrap().remove(&key);

        Ok(document)
    }

    /// The converted document currently on file for `source_path`, under
    /// whatever `content_hash`/`config_hash` was last stored for it.
    pub async fn get_document(&self, source_path: &str) -> Result<Option<String>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT cd.document FROM converted_documents cd \
             JOIN conversion_sources cs ON cs.source_path = cd.source_path AND cs.content_hash = cd.content_hash \
             WHERE cd.source_path = ? \
             ORDER BY cd.converted_at DESC LIMIT 1",
        )
        .bind(source_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Remove a source and all of its cached conversions. No-op if unknown.
    pub async fn invalidate(&self, source_path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM converted_documents WHERE source_path = ?")
            .bind(source_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversion_sources WHERE source_path = ?")
            .bind(source_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Snapshot of every known source.
    pub async fn list_sources(&self) -> Result<Vec<SourceRecord>> {
        let rows: Vec<(String, String, Option<i64>, Option<i64>, i64)> = sqlx::query_as(
            "SELECT source_path, content_hash, size, mtime, discovered_at FROM conversion_sources ORDER BY source_path",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(source_path, content_hash, size, mtime, discovered_at)| SourceRecord {
                source_path,
                content_hash,
                size,
                mtime,
                discovered_at,
            })
            .collect())
    }

    pub fn hash_content(bytes: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

/// One-shot, idempotent upgrade: older deployments of this cache predate
/// the `config_hash` column; this adds it with a default empty string so
/// pre-existing rows keep matching lookups that don't care about config.
async fn migrate_config_hash_column(pool: &SqlitePool) -> Result<()> {
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('converted_documents')")
        .fetch_all(pool)
        .await?;
    if !columns.iter().any(|c| c == "config_hash") {
        sqlx::query("ALTER TABLE converted_documents ADD COLUMN config_hash TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_cache() -> ConvertCache {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ConvertCache::open(pool).await.unwrap()
    }

    #[test]
    fn hash_content_is_deterministic() {
        assert_eq!(
            ConvertCache::hash_content(b"hello"),
            ConvertCache::hash_content(b"hello")
        );
        assert_ne!(
            ConvertCache::hash_content(b"hello"),
            ConvertCache::hash_content(b"world")
        );
    }

    #[tokio::test]
    async fn second_call_hits_cache_without_reconverting() {
        let cache = memory_cache().await;
        let hash = ConvertCache::hash_content(b"content");

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let text = cache
            .get_or_convert("book.pdf", &hash, "cfg", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok("converted".to_string())
            })
            .await
            .unwrap();
        assert_eq!(text, "converted");

        let text2 = cache
            .get_or_convert("book.pdf", &hash, "cfg", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok("converted again".to_string())
            })
            .await
            .unwrap();
        assert_eq!(text2, "converted");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_config_hash_reconverts() {
        let cache = memory_cache().await;
        let hash = ConvertCache::hash_content(b"content");

        cache
            .get_or_convert("book.pdf", &hash, "cfg-a", || Ok("a".to_string()))
            .await
            .unwrap();
        let text_b = cache
            .get_or_convert("book.pdf", &hash, "cfg-b", || Ok("b".to_string()))
            .await
            .unwrap();
        assert_eq!(text_b, "b");
    }

    #[tokio::test]
    async fn content_hash_change_discards_prior_conversions() {
        let cache = memory_cache().await;
        let hash_a = ConvertCache::hash_content(b"v1");
        let hash_b = ConvertCache::hash_content(b"v2");

        cache
            .get_or_convert("book.pdf", &hash_a, "cfg", || Ok("old".to_string()))
            .await
            .unwrap();
        cache
            .get_or_convert("book.pdf", &hash_b, "cfg", || Ok("new".to_string()))
            .await
            .unwrap();

        assert_eq!(
            cache.get_document("book.pdf").await.unwrap(),
            Some("new".to_string())
        );
    }

    #[tokio::test]
    async fn converter_error_does_not_poison_the_cache() {
        let cache = memory_cache().await;
        let hash = ConvertCache::hash_content(b"content");

        let first = cache
            .get_or_convert("book.pdf", &hash, "cfg", || anyhow::bail!("boom"))
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_convert("book.pdf", &hash, "cfg", || Ok("recovered".to_string()))
            .await
            .unwrap();
        assert_eq!(second, "recovered");
    }

    #[tokio::test]
    async fn invalidate_removes_source_and_conversions() {
        let cache = memory_cache().await;
        let hash = ConvertCache::hash_content(b"content");
        cache
            .get_or_convert("book.pdf", &hash, "cfg", || Ok("x".to_string()))
            .await
            .unwrap();

        cache.invalidate("book.pdf").await.unwrap();

        assert_eq!(cache.get_document("book.pdf").await.unwrap(), None);
        assert!(cache.list_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_callers_on_same_key_converge_on_one_conversion() {
        let cache = Arc::new(memory_cache().await);
        let hash = ConvertCache::hash_content(b"content");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let hash = hash.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_convert("shared.pdf", &hash, "cfg", || {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok("converted".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert!(results.iter().all(|r| r == "converted"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
