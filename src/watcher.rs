//! Debounced filesystem watcher (`spec.md` §4.7).
//!
//! Observes every configured directory (home root, global paths, vault
//! roots, project roots, code-group repos) recursively and submits
//! `Source`-scoped reindex jobs through the [`IndexingQueue`] once changes
//! go quiet. Grounded in the teacher's worker-task-plus-channel shape, with
//! the debounce itself modeled the way the system this crate was
//! distilled from reset a single timer on every enqueue: a background task
//! holds a pending-paths set behind a mutex and a generation counter; each
//! enqueue bumps the generation and spawns a fresh `tokio::time::sleep`,
//! and only the task holding the latest generation when its sleep
//! completes actually drains the set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::IndexRequest;
use crate::queue::IndexingQueue;

const SUPPORTED_EXTENSIONS: &[&str] = &["md", "txt", "pdf", "epub"];

/// Returns the set of directories this configuration wants watched.
pub fn get_watch_paths(config: &Config) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = &config.home {
        paths.push(home.clone());
    }
    paths.extend(config.global_paths.iter().cloned());
    paths.extend(config.obsidian_vaults.iter().cloned());
    for project in config.projects.values() {
        paths.extend(project.roots.iter().cloned());
    }
    for roots in config.code_groups.values() {
        paths.extend(roots.iter().cloned());
    }
    paths
}

fn is_git_state_file(path: &Path) -> bool {
    let mut found_git = false;
    for component in path.components() {
        if let std::path::Component::Normal(name) = component {
            if found_git {
                return name == "HEAD" || name == "refs" || path.components().any(|c| c.as_os_str() == "refs");
            }
            if name == ".git" {
                found_git = true;
            }
        }
    }
    found_git
}

fn in_hidden_directory(path: &Path, root: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    relative.components().any(|c| match c {
        std::path::Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Resolve the collection a changed path belongs to, per `spec.md` §4.7's
/// file→collection mapping. Returns `None` for unmapped paths (logged by
/// the caller as a warning, not an error).
fn resolve_collection(config: &Config, path: &Path) -> Option<String> {
    if let Some(home) = &config.home {
        if path.starts_with(home) {
            return Some("home".to_string());
        }
    }
    for global in &config.global_paths {
        if path.starts_with(global) {
            let name = global
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| global.to_string_lossy().to_string());
            return Some(name);
        }
    }
    for vault in &config.obsidian_vaults {
        if path.starts_with(vault) {
            return Some("obsidian".to_string());
        }
    }
    for (name, project) in &config.projects {
        if project.roots.iter().any(|r| path.starts_with(r)) {
            return Some(name.clone());
        }
    }
    for (name, roots) in &config.code_groups {
        if roots.iter().any(|r| path.starts_with(r)) {
            return Some(name.clone());
        }
    }
    None
}

/// Accumulates unique paths behind one reset-on-enqueue timer. Mirrors the
/// debounced queue's drain-on-quiet contract: stopping flushes whatever is
/// pending exactly once.
struct Debouncer {
    pending: Mutex<HashSet<PathBuf>>,
    generation: Mutex<u64>,
}

impl Debouncer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashSet::new()),
            generation: Mutex::new(0),
        })
    }

    /// Add `path` to the pending set and (re)arm the debounce timer. When
    /// the timer fires without being superseded by a later enqueue, it
    /// drains the set and hands the batch to `on_fire`.
    fn enqueue<F>(self: &Arc<Self>, path: PathBuf, debounce: Duration, on_fire: F)
    where
        F: Fn(HashSet<PathBuf>) + Send + Sync + 'static,
    {
        self.pending.lock().unwrap().insert(path);
        let my_generation = {
            let mut gen = self.generation.lock().unwrap();
            *gen += 1;
            *gen
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let fire = { *this.generation.lock().unwrap() == my_generation };
            if !fire {
                return;
            }
            let batch = std::mem::take(&mut *this.pending.lock().unwrap());
            if !batch.is_empty() {
                on_fire(batch);
            }
        });
    }

    /// Drain whatever is pending right now, bypassing the timer. Used when
    /// the watcher is stopped.
    fn flush<F>(&self, on_fire: F)
    where
        F: Fn(HashSet<PathBuf>),
    {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        if !batch.is_empty() {
            on_fire(batch);
        }
    }
}

/// Handle to a running filesystem watcher. Dropping it stops the
/// underlying `notify` watcher; pending debounced paths are not flushed
/// automatically — call [`FsWatcher::stop`] first if that matters.
pub struct FsWatcher {
    _watcher: notify::RecommendedWatcher,
    debouncer: Arc<Debouncer>,
}

impl FsWatcher {
    /// Start watching every directory [`get_watch_paths`] returns and
    /// submit a `Source` reindex job per changed file once debounced.
    pub fn start(config: Arc<Config>, queue: IndexingQueue) -> anyhow::Result<Self> {
        let debounce = Duration::from_secs_f64(config.watcher.debounce_seconds);
        let debouncer = Debouncer::new();
        let roots = get_watch_paths(&config);

        let watch_debouncer = debouncer.clone();
        let watch_config = config.clone();
        let watch_queue = queue.clone();
        let roots_for_events = roots.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("filesystem watch error: {e}");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }

            for path in event.paths {
                let is_git_state = is_git_state_file(&path);
                if !is_git_state {
                    if !has_supported_extension(&path) {
                        continue;
                    }
                    let under_hidden = roots_for_events
                        .iter()
                        .any(|root| path.starts_with(root) && in_hidden_directory(&path, root));
                    if under_hidden {
                        continue;
                    }
                }

                let config = watch_config.clone();
                let queue = watch_queue.clone();
                watch_debouncer.enqueue(path, debounce, move |batch| {
                    submit_batch(&config, &queue, batch);
                });
            }
        })?;

        for root in &roots {
            if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                warn!("failed to watch {}: {e}", root.display());
            } else {
                debug!("watching {}", root.display());
            }
        }

        Ok(Self {
            _watcher: watcher,
            debouncer,
        })
    }

    /// Flush pending debounced paths once, bypassing the timer. Called on
    /// shutdown so in-flight changes aren't lost.
    pub fn stop(&self, config: &Config, queue: &IndexingQueue) {
        self.debouncer.flush(|batch| submit_batch(config, queue, batch));
    }
}

fn submit_batch(config: &Config, queue: &IndexingQueue, batch: HashSet<PathBuf>) {
    info!("debounced filesystem batch: {} path(s)", batch.len());
    let mut seen_collections = HashSet::new();
    for path in batch {
        match resolve_collection(config, &path) {
            Some(collection) => {
                if seen_collections.insert(collection.clone()) {
                    queue.submit(IndexRequest::Source {
                        collection,
                        path: path.to_string_lossy().to_string(),
                        force: false,
                    });
                }
            }
            None => warn!("unmapped watched path, ignoring: {}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_head_and_refs_are_special_cased() {
        assert!(is_git_state_file(Path::new("/repo/.git/HEAD")));
        assert!(is_git_state_file(Path::new("/repo/.git/refs/heads/main")));
        assert!(!is_git_state_file(Path::new("/repo/src/main.rs")));
    }

    #[test]
    fn hidden_directory_components_are_detected() {
        let root = Path::new("/vault");
        assert!(in_hidden_directory(Path::new("/vault/.obsidian/config.md"), root));
        assert!(!in_hidden_directory(Path::new("/vault/notes/today.md"), root));
    }

    #[test]
    fn supported_extensions_match_configured_set() {
        assert!(has_supported_extension(Path::new("note.md")));
        assert!(has_supported_extension(Path::new("book.EPUB")));
        assert!(!has_supported_extension(Path::new("image.png")));
    }

    #[test]
    fn resolve_collection_maps_home_and_global_and_vault() {
        let config: Config = toml::from_str(
            "home = \"/home/alice\"\nglobal_paths = [\"/srv/shared\"]\nobsidian_vaults = [\"/vaults/main\"]\n[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n",
        )
        .unwrap();

        assert_eq!(
            resolve_collection(&config, Path::new("/home/alice/notes.md")),
            Some("home".to_string())
        );
        assert_eq!(
            resolve_collection(&config, Path::new("/srv/shared/readme.md")),
            Some("shared".to_string())
        );
        assert_eq!(
            resolve_collection(&config, Path::new("/vaults/main/daily.md")),
            Some("obsidian".to_string())
        );
        assert_eq!(resolve_collection(&config, Path::new("/elsewhere/x.md")), None);
    }
}
