//! `ctx` — the command-line front end for the context-harness library.
//!
//! Every subcommand opens the per-group index store and the shared
//! conversion cache, then either drives them directly (`init`, `sources`,
//! `search`, `get`) or spins up the single-writer [`queue::IndexingQueue`]
//! so that indexing, watching, and serving all go through the same
//! serialization point described in `spec.md` §4.5.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rmcp::transport::stdio;
use rmcp::ServiceExt;

use context_harness::config::{self, Config};
use context_harness::convert_cache::ConvertCache;
use context_harness::models::{CollectionType, IndexRequest, SearchFilters};
use context_harness::queue::IndexingQueue;
use context_harness::{db, get, leader, logging, mcp, migrate, search, server, sources, system_watcher, watcher};

#[derive(Parser)]
#[command(
    name = "ctx",
    about = "A local-first retrieval-augmented search engine for personal document collections",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/ctx.toml")]
    config: PathBuf,

    /// Index-store group to operate on (overrides `group_name` in config)
    #[arg(long, global = true)]
    group: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the per-group index store and the shared conversion cache,
    /// running schema migrations on both.
    Init,

    /// List configured collections and whether their backing storage is
    /// reachable.
    Sources,

    /// Index one collection, or every configured collection.
    Sync {
        /// Collection name (e.g. `home`, `obsidian`, a code group or
        /// project name). Omit to sync everything.
        collection: Option<String>,

        /// Reindex even if nothing appears to have changed.
        #[arg(long)]
        force: bool,
    },

    /// Run a hybrid dense+lexical search.
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        top_k: i64,

        #[arg(long)]
        collection: Option<String>,

        #[arg(long)]
        collection_type: Option<CollectionType>,

        #[arg(long)]
        path_prefix: Option<String>,

        #[arg(long)]
        source_type: Option<String>,

        #[arg(long)]
        sender: Option<String>,

        #[arg(long)]
        author: Option<String>,

        #[arg(long)]
        date_from: Option<chrono::DateTime<chrono::Utc>>,

        #[arg(long)]
        date_to: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Reassemble and print a source's full chunk sequence.
    Get { collection: String, path: String },

    /// Start a tool endpoint.
    Serve {
        #[command(subcommand)]
        transport: ServeTransport,
    },

    /// Run the leader lock, startup sync, and filesystem/system-DB
    /// watchers until interrupted.
    Watch,
}

#[derive(Subcommand)]
enum ServeTransport {
    /// Serve the MCP tool surface over stdio.
    Mcp,
    /// Serve the authenticated HTTP tool surface.
    Http,
}

async fn open_stores(config: &Config) -> anyhow::Result<(sqlx::SqlitePool, ConvertCache)> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let shared_pool = db::connect_shared(config).await?;
    let convert_cache = ConvertCache::open(shared_pool).await?;

    Ok((pool, convert_cache))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;
    if let Some(group) = &cli.group {
        cfg = cfg.with_overrides(group.clone());
    }
    let config = Arc::new(cfg);

    match cli.command {
        Commands::Init => {
            let (pool, _convert_cache) = open_stores(&config).await?;
            pool.close().await;
            println!("Index store initialized at {}", config.group_index_db_path().display());
        }

        Commands::Sources => {
            sources::list_sources(&config);
        }

        Commands::Sync { collection, force } => {
            let (pool, convert_cache) = open_stores(&config).await?;
            let queue = IndexingQueue::spawn(config.clone(), pool, Arc::new(convert_cache));

            let request = match collection {
                Some(name) => IndexRequest::Collection { name, force },
                None => IndexRequest::All { force },
            };
            let result = queue.submit_and_wait(request).await?;
            println!(
                "indexed={} skipped_unchanged={} deleted={} chunks_written={} chunks_embedded={} errors={}",
                result.sources_indexed,
                result.sources_skipped_unchanged,
                result.sources_deleted,
                result.chunks_written,
                result.chunks_embedded,
                result.errors.len()
            );
            for err in result.errors.iter().take(10) {
                eprintln!("error: {err}");
            }
        }

        Commands::Search {
            query,
            top_k,
            collection,
            collection_type,
            path_prefix,
            source_type,
            sender,
            author,
            date_from,
            date_to,
        } => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            let filters = SearchFilters {
                collection,
                collection_type,
                path_prefix,
                updated_after: None,
                source_type,
                sender,
                author,
                date_from,
                date_to,
            };
            search::run_search(&pool, &config, &query, top_k, &filters).await?;
        }

        Commands::Get { collection, path } => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            get::run_get(&pool, &collection, &path).await?;
        }

        Commands::Serve { transport } => {
            let (pool, convert_cache) = open_stores(&config).await?;
            let convert_cache = Arc::new(convert_cache);
            let queue = IndexingQueue::spawn(config.clone(), pool.clone(), convert_cache.clone());

            match transport {
                ServeTransport::Mcp => {
                    let bridge = mcp::McpBridge::new(config.clone(), pool, convert_cache, queue);
                    let service = bridge.serve(stdio()).await?;
                    service.waiting().await?;
                }
                ServeTransport::Http => {
                    server::run_server(config.clone(), pool, convert_cache, queue).await?;
                }
            }
        }

        Commands::Watch => {
            let (pool, convert_cache) = open_stores(&config).await?;
            let convert_cache = Arc::new(convert_cache);
            let queue = IndexingQueue::spawn(config.clone(), pool, convert_cache);

            let lock_path = leader::lock_path_for_config(&config);
            let lock = Arc::new(leader::LeaderLock::try_acquire(&lock_path)?);

            let done_event = Arc::new(tokio::sync::Notify::new());
            let fs_watch: Arc<std::sync::Mutex<Option<watcher::FsWatcher>>> = Arc::new(std::sync::Mutex::new(None));
            let sys_watch: Arc<std::sync::Mutex<Option<system_watcher::SystemWatcher>>> =
                Arc::new(std::sync::Mutex::new(None));

            let start_watchers = {
                let config = config.clone();
                let queue = queue.clone();
                let fs_watch = fs_watch.clone();
                let sys_watch = sys_watch.clone();
                let done_event = done_event.clone();
                move || {
                    tokio::spawn({
                        let config = config.clone();
                        let queue = queue.clone();
                        let done_event = done_event.clone();
                        async move {
                            leader::startup_sync(config, queue, done_event).await;
                        }
                    });
                    match watcher::FsWatcher::start(config.clone(), queue.clone()) {
                        Ok(w) => *fs_watch.lock().unwrap() = Some(w),
                        Err(e) => tracing::warn!(error = %e, "failed to start filesystem watcher"),
                    }
                    match system_watcher::SystemWatcher::start(config.clone(), queue.clone()) {
                        Ok(w) => *sys_watch.lock().unwrap() = Some(w),
                        Err(e) => tracing::warn!(error = %e, "failed to start system-DB watcher"),
                    }
                }
            };

            if lock.is_leader() {
                tracing::info!("acquired leader lock at {}", lock_path.display());
                start_watchers();
            } else {
                tracing::info!("another process holds the leader lock; waiting for promotion");
                lock.start_retry(std::time::Duration::from_secs(5), start_watchers);
            }

            tokio::signal::ctrl_c().await?;
            if let Some(w) = fs_watch.lock().unwrap().as_ref() {
                w.stop(&config, &queue);
            }
            lock.close();
        }
    }

    Ok(())
}
