//! Leader lock and startup sync (`spec.md` §4.8).
//!
//! Exactly one process per index store may run indexing. Leadership is an
//! exclusive advisory lock on a file next to the store (`fs2`, same
//! primitive the teacher already depended on); non-holders retry on a
//! short interval from a background thread until they either acquire it
//! or the process exits. Promotion fires a caller-supplied callback rather
//! than a generic event, following the "callbacks become messages"
//! convention: the caller passes a small closure invoked exactly once.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use fs2::FileExt;
use tracing::{info, warn};

use crate::config::Config;

/// Derive the lock file path for a configuration: `<db_path>.lock` for the
/// default group, `<group_db_dir>/<group_name>/index.db.lock` for a named
/// group, mirroring [`Config::group_index_db_path`].
pub fn lock_path_for_config(config: &Config) -> PathBuf {
    let db_path = config.group_index_db_path();
    let mut lock_path = db_path.into_os_string();
    lock_path.push(".lock");
    PathBuf::from(lock_path)
}

/// An exclusive file lock over the index store, with a background retry
/// thread for non-holders.
pub struct LeaderLock {
    path: PathBuf,
    file: Mutex<Option<File>>,
    is_leader: Arc<AtomicBool>,
    retry_handle: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
}

impl LeaderLock {
    /// Attempt to acquire the lock immediately, without retrying. Creates
    /// the lock file (and its parent directory) if necessary.
    pub fn try_acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(&path)?;

        let acquired = file.try_lock_exclusive().is_ok();
        if acquired {
            info!("acquired leader lock at {}", path.display());
        }

        Ok(Self {
            path,
            file: Mutex::new(if acquired { Some(file) } else { None }),
            is_leader: Arc::new(AtomicBool::new(acquired)),
            retry_handle: Mutex::new(None),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Start a background thread that re-attempts acquisition every
    /// `interval` until it succeeds or [`LeaderLock::stop_retry`] /
    /// [`LeaderLock::close`] is called. Fires `on_promote` exactly once,
    /// from the retry thread, the moment the lock is acquired. No-op if
    /// this lock is already held or a retry thread is already running.
    pub fn start_retry<F>(self: &Arc<Self>, interval: Duration, on_promote: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_leader() {
            return;
        }
        let mut guard = self.retry_handle.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let path = self.path.clone();
        let is_leader = self.is_leader.clone();
        let file_slot = self.file.lock().unwrap();
        drop(file_slot);

        let lock_ref = self.clone();
        let handle = std::thread::spawn(move || {
            let mut on_promote = Some(on_promote);
            while thread_running.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if !thread_running.load(Ordering::SeqCst) {
                    break;
                }
                match OpenOptions::new().create(true).write(true).open(&path) {
                    Ok(file) => {
                        if file.try_lock_exclusive().is_ok() {
                            *lock_ref.file.lock().unwrap() = Some(file);
                            is_leader.store(true, Ordering::SeqCst);
                            info!("promoted to leader for lock at {}", path.display());
                            if let Some(cb) = on_promote.take() {
                                cb();
                            }
                            break;
                        }
                    }
                    Err(e) => warn!("leader-retry open failed for {}: {e}", path.display()),
                }
            }
        });

        *guard = Some((handle, running));
    }

    /// Stop the retry thread without releasing a held lock. Safe to call
    /// whether or not a retry thread is running.
    pub fn stop_retry(&self) {
        let mut guard = self.retry_handle.lock().unwrap();
        if let Some((handle, running)) = guard.take() {
            running.store(false, Ordering::SeqCst);
            let _ = handle.join();
        }
    }

    /// Release the lock (if held) and stop the retry thread (if running).
    pub fn close(&self) {
        self.stop_retry();
        self.is_leader.store(false, Ordering::SeqCst);
        let mut file = self.file.lock().unwrap();
        if let Some(f) = file.take() {
            let _ = fs2::FileExt::unlock(&f);
        }
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        self.close();
    }
}

/// Enumerate every configured source and submit one `IndexJob` per unit,
/// per `spec.md` §4.8's startup sync: home, each global path, each vault,
/// each code group, each project, and the three system sources. Signals
/// `done_event` once enumeration (not indexing) completes, so a watcher
/// can wait on it before starting without racing the initial backfill.
pub async fn startup_sync(config: Arc<Config>, queue: crate::queue::IndexingQueue, done_event: Arc<tokio::sync::Notify>) {
    let collection = |name: String| crate::models::IndexRequest::Collection { name, force: false };

    if config.home.is_some() || !config.global_paths.is_empty() {
        queue.submit(collection("home".to_string()));
        for path in &config.global_paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string());
            queue.submit(collection(name));
        }
    }
    for name in config.projects.keys() {
        queue.submit(collection(name.clone()));
    }
    if config.is_collection_enabled("obsidian") {
        queue.submit(collection("obsidian".to_string()));
    }
    for name in config.code_groups.keys() {
        queue.submit(collection(name.clone()));
    }
    if config.is_collection_enabled("calibre") {
        queue.submit(collection("calibre".to_string()));
    }
    if config.is_collection_enabled("email") {
        queue.submit(collection("email".to_string()));
    }
    if config.is_collection_enabled("rss") {
        queue.submit(collection("rss".to_string()));
    }

    done_event.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock_path() -> PathBuf {
        std::env::temp_dir().join(format!("ctx-leader-test-{}.lock", uuid::Uuid::new_v4()))
    }

    #[test]
    fn first_acquirer_becomes_leader() {
        let path = temp_lock_path();
        let lock = LeaderLock::try_acquire(&path).unwrap();
        assert!(lock.is_leader());
        lock.close();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn second_acquirer_does_not_become_leader_while_first_holds() {
        let path = temp_lock_path();
        let first = LeaderLock::try_acquire(&path).unwrap();
        assert!(first.is_leader());

        let second = LeaderLock::try_acquire(&path).unwrap();
        assert!(!second.is_leader());

        first.close();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn close_releases_the_lock_for_a_new_acquirer() {
        let path = temp_lock_path();
        let first = LeaderLock::try_acquire(&path).unwrap();
        assert!(first.is_leader());
        first.close();

        let second = LeaderLock::try_acquire(&path).unwrap();
        assert!(second.is_leader());
        second.close();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn lock_path_for_default_group_is_db_path_with_lock_suffix() {
        let config: Config = toml::from_str(
            "db_path = \"/data/index.db\"\n[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n",
        )
        .unwrap();
        assert_eq!(lock_path_for_config(&config), PathBuf::from("/data/index.db.lock"));
    }

    #[test]
    fn lock_path_for_named_group_lives_under_group_dir() {
        let config: Config = toml::from_str(
            "group_name = \"personal\"\ngroup_db_dir = \"/data/groups\"\n[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n",
        )
        .unwrap();
        assert_eq!(
            lock_path_for_config(&config),
            PathBuf::from("/data/groups/personal/index.db.lock")
        );
    }
}
