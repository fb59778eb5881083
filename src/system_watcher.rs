//! Debounced watcher for the three system sources: email store, RSS
//! store, calibre libraries (`spec.md` §4.7).
//!
//! Each enabled source watches its containing directory and coalesces any
//! modification — including the write-ahead-log churn a SQLite-backed mail
//! or feed store produces on every write — per source with a longer
//! debounce (default 10s) than the filesystem watcher's, submitting a
//! single `system_collection` reindex job once quiet rather than one job
//! per touched file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::IndexRequest;
use crate::queue::IndexingQueue;

/// One per-source debounce timer, keyed by collection name (`"email"`,
/// `"rss"`, or `"calibre"`).
struct SourceDebounce {
    generation: Mutex<u64>,
}

impl SourceDebounce {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            generation: Mutex::new(0),
        })
    }

    fn touch<F>(self: &Arc<Self>, debounce: Duration, on_fire: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let my_generation = {
            let mut gen = self.generation.lock().unwrap();
            *gen += 1;
            *gen
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if *this.generation.lock().unwrap() == my_generation {
                on_fire();
            }
        });
    }
}

/// Handle to the running system-DB watchers. One `notify::Watcher` per
/// enabled source, all keeping a single debounce timer each.
pub struct SystemWatcher {
    _watchers: Vec<notify::RecommendedWatcher>,
}

impl SystemWatcher {
    /// Watch the containing directory of every enabled system source
    /// (email, RSS, calibre) and submit a coalesced `system_collection`
    /// job per source once its debounce quiets down.
    pub fn start(config: Arc<Config>, queue: IndexingQueue) -> anyhow::Result<Self> {
        let debounce = Duration::from_secs_f64(config.watcher.system_debounce_seconds);
        let mut sources: HashMap<String, PathBuf> = HashMap::new();

        if let Some(email) = &config.email {
            if let Some(dir) = email.db_path.parent() {
                sources.insert("email".to_string(), dir.to_path_buf());
            }
        }
        if let Some(rss) = &config.rss {
            if let Some(dir) = rss.db_path.parent() {
                sources.insert("rss".to_string(), dir.to_path_buf());
            }
        }
        for library in &config.calibre_libraries {
            // All calibre libraries coalesce into the single `calibre`
            // collection, so they share one debounce timer.
            sources.entry("calibre".to_string()).or_insert_with(|| library.clone());
        }

        let mut watchers = Vec::new();
        let debounces: HashMap<String, Arc<SourceDebounce>> =
            sources.keys().map(|name| (name.clone(), SourceDebounce::new())).collect();

        for (name, dir) in &sources {
            let name = name.clone();
            let queue = queue.clone();
            let debounce_timer = debounces.get(&name).unwrap().clone();

            let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_err() {
                    return;
                }
                let name = name.clone();
                let queue = queue.clone();
                debounce_timer.touch(debounce, move || {
                    info!("system source '{name}' quiet, submitting reindex");
                    queue.submit(IndexRequest::Collection {
                        name: name.clone(),
                        force: false,
                    });
                });
            })?;

            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!("failed to watch system source directory {}: {e}", dir.display());
            }
            watchers.push(watcher);
        }

        Ok(Self { _watchers: watchers })
    }
}

/// Returns the directories that would be watched, for the directory that
/// contains `path` (used by tests and by anything that needs to verify a
/// source is actually coverable before starting the watcher).
pub fn containing_dir(path: &Path) -> Option<PathBuf> {
    path.parent().map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containing_dir_returns_parent() {
        assert_eq!(
            containing_dir(Path::new("/data/mail/store.db")),
            Some(PathBuf::from("/data/mail"))
        );
    }
}
