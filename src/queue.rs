//! Single-writer indexing queue (`spec.md` §4.3, §5).
//!
//! Exactly one task ever holds the `sqlx::SqlitePool` write connection for
//! indexing: every caller — the CLI, the HTTP/MCP tool endpoints, the
//! filesystem watcher, the system-DB watcher, and the startup sync — submits
//! an [`IndexJob`] through this queue instead of calling an indexer
//! directly. This is what keeps concurrent writers from racing SQLite's
//! single-writer lock (`spec.md` §5 concurrency model) and gives every
//! caller one place to check indexing progress.
//!
//! Grounded in the teacher's worker-thread-plus-channel pattern, adapted to
//! `tokio`: a bounded `crossbeam_channel` queues jobs for a single worker
//! task, and each submission optionally carries a `tokio::sync::oneshot`
//! sender so `submit_and_wait` can block until that specific job finishes
//! without holding up the queue for anyone else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::error::Result;
use crate::indexers;
use crate::models::{IndexJob, IndexRequest, IndexResult, IndexingStatus};

struct Envelope {
    job: IndexJob,
    reply: Option<oneshot::Sender<Result<IndexResult>>>,
}

/// Shared job-status board, queried by the HTTP/MCP "indexing in progress"
/// surface (`spec.md` §6) without needing to talk to the worker task.
#[derive(Default, Clone)]
pub struct StatusBoard(Arc<Mutex<HashMap<String, IndexingStatus>>>);

impl StatusBoard {
    fn set(&self, id: &str, status: IndexingStatus) {
        self.0.lock().unwrap().insert(id.to_string(), status);
    }

    pub fn get(&self, id: &str) -> Option<IndexingStatus> {
        self.0.lock().unwrap().get(id).cloned()
    }

    /// True if any job is currently `Queued` or `Running` — surfaced to
    /// search responses so callers know results might be incomplete.
    pub fn is_indexing(&self) -> bool {
        self.0
            .lock()
            .unwrap()
            .values()
            .any(|s| matches!(s, IndexingStatus::Queued | IndexingStatus::Running))
    }
}

/// Handle callers submit jobs through. Cloning is cheap; every clone shares
/// the same underlying worker.
#[derive(Clone)]
pub struct IndexingQueue {
    sender: Sender<Envelope>,
    status: StatusBoard,
}

impl IndexingQueue {
    /// Spawn the single worker task and return a handle to it. `pool` and
    /// `convert_cache` are moved into the worker; nothing else touches them
    /// for indexing writes for the lifetime of the process.
    pub fn spawn(config: Arc<Config>, pool: sqlx::SqlitePool, convert_cache: Arc<ConvertCache>) -> Self {
        let (sender, receiver): (Sender<Envelope>, Receiver<Envelope>) = crossbeam_channel::unbounded();
        let status = StatusBoard::default();

        let worker_status = status.clone();
        tokio::spawn(async move {
            run_worker(receiver, worker_status, config, pool, convert_cache).await;
        });

        Self { sender, status }
    }

    /// Enqueue `request` and return immediately with the job id. Use
    /// [`IndexingQueue::status`] to poll it, or [`IndexingQueue::submit_and_wait`]
    /// to block until it completes.
    pub fn submit(&self, request: IndexRequest) -> String {
        let id = Uuid::new_v4().to_string();
        let job = IndexJob {
            id: id.clone(),
            request,
            status: IndexingStatus::Queued,
            submitted_at: Utc::now(),
        };
        self.status.set(&id, IndexingStatus::Queued);
        // An unbounded channel only fails to send if the worker task has
        // panicked and dropped the receiver; there is no graceful recovery
        // from that, so the job is simply left `Queued` forever rather than
        // panicking the caller.
        let _ = self.sender.send(Envelope { job, reply: None });
        id
    }

    /// Enqueue `request` and await its result, without blocking other
    /// callers' submissions.
    pub async fn submit_and_wait(&self, request: IndexRequest) -> Result<IndexResult> {
        let id = Uuid::new_v4().to_string();
        let job = IndexJob {
            id: id.clone(),
            request,
            status: IndexingStatus::Queued,
            submitted_at: Utc::now(),
        };
        self.status.set(&id, IndexingStatus::Queued);

        let (tx, rx) = oneshot::channel();
        if self.sender.send(Envelope { job, reply: Some(tx) }).is_err() {
            return Err(crate::error::HarnessError::Other(anyhow::anyhow!(
                "indexing queue worker has shut down"
            )));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(crate::error::HarnessError::Other(anyhow::anyhow!(
                "indexing worker dropped the reply channel"
            ))),
        }
    }

    pub fn status(&self, id: &str) -> Option<IndexingStatus> {
        self.status.get(id)
    }

    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }
}

async fn run_worker(
    receiver: Receiver<Envelope>,
    status: StatusBoard,
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    convert_cache: Arc<ConvertCache>,
) {
    // `crossbeam_channel::Receiver::recv` blocks the calling thread, so it
    // is driven through `spawn_blocking` and bridged back into the async
    // worker loop one job at a time — this is what keeps the indexing
    // write path single-threaded while still letting the queue accept
    // submissions from async callers without blocking them.
    loop {
        let next = {
            let receiver = receiver.clone();
            tokio::task::spawn_blocking(move || receiver.recv()).await
        };

        let envelope = match next {
            Ok(Ok(envelope)) => envelope,
            _ => break, // all senders dropped; shut down
        };

        let Envelope { job, reply } = envelope;
        status.set(&job.id, IndexingStatus::Running);

        let outcome = run_job(&config, &pool, &convert_cache, &job.request).await;

        match &outcome {
            Ok(_) => status.set(&job.id, IndexingStatus::Done),
            Err(e) => status.set(&job.id, IndexingStatus::Failed(e.to_string())),
        }

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }
}

async fn run_job(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    request: &IndexRequest,
) -> Result<IndexResult> {
    match request {
        IndexRequest::All { force } => indexers::dispatch_all(config, pool, convert_cache, *force).await,
        IndexRequest::Collection { name, force } => {
            indexers::dispatch(config, pool, convert_cache, name, *force).await
        }
        IndexRequest::Source { collection, force, .. } => {
            // Single-source reindexing reuses the owning collection's full
            // indexer; `sync_items`'s content-hash compare makes this cheap
            // for everything except the one changed path.
            indexers::dispatch(config, pool, convert_cache, collection, *force).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_queue() -> IndexingQueue {
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
        let cache = Arc::new(ConvertCache::open(cache_pool).await.unwrap());

        let config: Config = toml::from_str("[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n").unwrap();
        IndexingQueue::spawn(Arc::new(config), pool, cache)
    }

    #[tokio::test]
    async fn submit_and_wait_returns_a_result() {
        let queue = test_queue().await;
        let result = queue.submit_and_wait(IndexRequest::All { force: false }).await.unwrap();
        assert_eq!(result.sources_seen, 0);
    }

    #[tokio::test]
    async fn submit_without_waiting_eventually_reaches_done() {
        let queue = test_queue().await;
        let id = queue.submit(IndexRequest::All { force: false });
        assert_eq!(queue.status(&id), Some(IndexingStatus::Queued));

        for _ in 0..50 {
            if matches!(queue.status(&id), Some(IndexingStatus::Done)) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job never reached Done");
    }

    #[tokio::test]
    async fn status_board_reports_indexing_in_progress() {
        let board = StatusBoard::default();
        assert!(!board.is_indexing());
        board.set("job-1", IndexingStatus::Running);
        assert!(board.is_indexing());
        board.set("job-1", IndexingStatus::Done);
        assert!(!board.is_indexing());
    }
}
