//! Typed error taxonomy for failures that callers must distinguish by kind.
//!
//! Most of the crate propagates through `anyhow::Result` like the rest of
//! this codebase, but a handful of call sites — the indexing queue, the
//! tool endpoint — need to match on *which* failure happened rather than
//! just log and bail. [`HarnessError`] carries those cases; anything else
//! folds into `Other` via `anyhow`'s blanket conversion.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The embedding service refused the connection. The current job
    /// should abort cleanly and be retried on the next change rather than
    /// poisoning the queue.
    #[error("embedding service unreachable: {0}")]
    EmbeddingUnreachable(String),

    /// A source database (email store, RSS store, calibre library) was
    /// busy or locked past the retry budget.
    #[error("source database locked: {0}")]
    DocumentLocked(String),

    /// The converter function itself raised. Nothing is cached.
    #[error("conversion failed for {path}: {source}")]
    ConverterFailed {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The on-disk schema version is newer than this binary understands.
    #[error("index store schema version {found} is newer than supported version {supported}")]
    SchemaVersionUnknown { found: i64, supported: i64 },

    /// A tool-endpoint convert request resolved outside every allowed root.
    /// The message is intentionally generic — it must not disclose the
    /// resolved path.
    #[error("path not accessible")]
    PathNotAllowed,

    /// The authentication subsystem is backing off this caller.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Database errors are opaque to callers that only care about "it failed" —
/// routed through `Other` rather than given their own variant, since nothing
/// in this crate branches on a specific `sqlx::Error` case.
impl From<sqlx::Error> for HarnessError {
    fn from(e: sqlx::Error) -> Self {
        HarnessError::Other(e.into())
    }
}

impl From<walkdir::Error> for HarnessError {
    fn from(e: walkdir::Error) -> Self {
        HarnessError::Other(e.into())
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(e: std::io::Error) -> Self {
        HarnessError::Other(e.into())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
