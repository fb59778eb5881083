//! Filesystem project indexer.
//!
//! Walks one or more root directories with glob include/exclude filters
//! and syncs the resulting files into a `project`-typed collection. Used
//! both for named `[projects.<name>]` entries and for the implicit `home`
//! and `global` collections built from `home`/`global_paths`.
//!
//! A directory under a root that itself looks like its own source (a
//! `.git` checkout or an Obsidian vault, marked by `.git`/`.obsidian`)
//! is delegated whole to [`super::git::run_one`]/[`super::vault::run_one`]
//! rather than walked as plain files — so a project folder that happens to
//! contain a cloned dependency or a notes vault gets that content indexed
//! with the right indexer's semantics (structural code chunks, commit
//! history, front matter) instead of being read as flat text. Delegated
//! sub-trees are not walked further by this indexer.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use walkdir::WalkDir;

use crate::config::{Config, ProjectConfig};
use crate::convert_cache::ConvertCache;
use crate::error::Result;
use crate::indexers::{get_or_create_collection, git, sync_items, vault};
use crate::models::{CollectionType, IndexResult, SourceItem};

const BINARY_EXTENSIONS: &[(&str, &str)] = &[
    (".pdf", "application/pdf"),
    (".epub", "application/epub+zip"),
];

pub async fn run(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    project_name: &str,
    force: bool,
) -> Result<IndexResult> {
    let project = config
        .projects
        .get(project_name)
        .ok_or_else(|| anyhow::anyhow!("unknown project: {project_name}"))?;

    let collection_id = get_or_create_collection(
        pool,
        project_name,
        CollectionType::Project,
        Some("project"),
    )
    .await?;

    let mut combined = IndexResult::default();
    let mut visited_dirs: HashSet<DirKey> = HashSet::new();

    for root in &project.roots {
        if !root.exists() {
            continue;
        }
        combined.merge(
            walk_and_delegate(
                config,
                pool,
                convert_cache,
                &collection_id,
                project_name,
                root,
                project,
                &mut visited_dirs,
                force,
            )
            .await?,
        );
    }

    Ok(combined)
}

/// Index `config.home` (if set) as collection `home` and each entry of
/// `config.global_paths` as its own collection named after the directory.
pub async fn run_home_and_global(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    force: bool,
) -> Result<IndexResult> {
    let default_project = ProjectConfig {
        roots: vec![],
        include_globs: vec![
            "**/*.md".to_string(),
            "**/*.txt".to_string(),
            "**/*.pdf".to_string(),
            "**/*.epub".to_string(),
        ],
        exclude_globs: vec![],
        follow_symlinks: false,
    };

    let mut combined = IndexResult::default();

    if let Some(home) = &config.home {
        let collection_id =
            get_or_create_collection(pool, "home", CollectionType::Project, Some("home directory")).await?;
        let mut visited = HashSet::new();
        combined.merge(
            walk_and_delegate(
                config,
                pool,
                convert_cache,
                &collection_id,
                "home",
                home,
                &default_project,
                &mut visited,
                force,
            )
            .await?,
        );
    }

    for path in &config.global_paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        let collection_id =
            get_or_create_collection(pool, &name, CollectionType::Project, Some("global path")).await?;
        let mut visited = HashSet::new();
        combined.merge(
            walk_and_delegate(
                config,
                pool,
                convert_cache,
                &collection_id,
                &name,
                path,
                &default_project,
                &mut visited,
                force,
            )
            .await?,
        );
    }

    Ok(combined)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(unix)]
type DirKey = (u64, u64);
#[cfg(not(unix))]
type DirKey = std::path::PathBuf;

#[cfg(unix)]
fn dir_key(metadata: &std::fs::Metadata) -> DirKey {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn dir_key(_metadata: &std::fs::Metadata) -> DirKey {
    std::path::PathBuf::new()
}

/// Walk `root`, delegating any `.git`/`.obsidian`-marked sub-directory to
/// the matching indexer's `run_one` (with `prune_scope` set to that
/// sub-tree's path prefix so reconciliation only ever touches sources
/// under it), and syncing everything else as plain project files.
/// Symlinked directories are tracked by `(dev, ino)` in `visited` so a
/// symlink cycle is walked at most once.
#[allow(clippy::too_many_arguments)]
async fn walk_and_delegate(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    collection_id: &str,
    collection_name: &str,
    root: &std::path::Path,
    project: &ProjectConfig,
    visited: &mut HashSet<DirKey>,
    force: bool,
) -> Result<IndexResult> {
    let include_set = build_globset(&project.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/.obsidian/**".to_string(),
    ];
    default_excludes.extend(project.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut combined = IndexResult::default();
    let mut plain_items = Vec::new();

    let mut walker = WalkDir::new(root).follow_links(project.follow_symlinks).into_iter();
    loop {
        let entry = match walker.next() {
            Some(Ok(e)) => e,
            Some(Err(_)) => continue,
            None => break,
        };

        if entry.file_type().is_dir() {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_dir() && !visited.insert(dir_key(&metadata)) {
                    walker.skip_current_dir();
                    continue;
                }
            }

            if entry.depth() > 0 {
                let path = entry.path();
                let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string();

                if path.join(".git").exists() {
                    combined.merge(
                        git::run_one(config, pool, convert_cache, collection_id, collection_name, path, force).await?,
                    );
                    walker.skip_current_dir();
                    continue;
                }
                if path.join(".obsidian").exists() {
                    let prune_scope = format!("{rel}/");
                    combined.merge(
                        vault::run_one(
                            config,
                            pool,
                            convert_cache,
                            collection_id,
                            collection_name,
                            path,
                            &[],
                            Some(&prune_scope),
                            force,
                        )
                        .await?,
                    );
                    walker.skip_current_dir();
                    continue;
                }
            }
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        if let Some(item) = load_plain_item(collection_name, path, &rel_str)? {
            plain_items.push(item);
        }
    }

    combined.merge(sync_items(config, pool, convert_cache, collection_id, plain_items, None, force).await?);

    Ok(combined)
}

fn load_plain_item(collection_name: &str, path: &std::path::Path, rel_str: &str) -> Result<Option<SourceItem>> {
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    let fs_metadata = std::fs::metadata(path)?;
    let mtime = fs_metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    let size = Some(fs_metadata.len() as i64);
    let title = path.file_name().map(|n| n.to_string_lossy().to_string());

    if let Some((_, mime)) = BINARY_EXTENSIONS.iter().find(|(e, _)| *e == ext) {
        let bytes = std::fs::read(path)?;
        return Ok(Some(SourceItem {
            collection_name: collection_name.to_string(),
            collection_type: CollectionType::Project,
            path: rel_str.to_string(),
            title,
            content_type: mime.to_string(),
            source_type: "binary-document".to_string(),
            body: String::new(),
            raw_bytes: Some(bytes),
            mtime,
            size,
            metadata: Default::default(),
            pre_chunked: None,
        }));
    }

    match std::fs::read_to_string(path) {
        Ok(body) => Ok(Some(SourceItem {
            collection_name: collection_name.to_string(),
            collection_type: CollectionType::Project,
            path: rel_str.to_string(),
            title,
            content_type: "text/plain".to_string(),
            source_type: "file".to_string(),
            body,
            raw_bytes: None,
            mtime,
            size,
            metadata: Default::default(),
            pre_chunked: None,
        })),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(roots: Vec<std::path::PathBuf>) -> ProjectConfig {
        ProjectConfig {
            roots,
            include_globs: vec!["**/*.md".to_string(), "**/*.txt".to_string()],
            exclude_globs: vec![],
            follow_symlinks: false,
        }
    }

    fn init_repo(path: &std::path::Path) {
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(path)
                .env("GIT_AUTHOR_NAME", "Test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "Test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .unwrap();
        };
        run(&["init", "-q"]);
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "initial"]);
    }

    #[tokio::test]
    async fn git_submodule_is_delegated_not_walked_as_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vendor/lib")).unwrap();
        std::fs::write(dir.path().join("vendor/lib/README.md"), "vendored readme").unwrap();
        std::fs::write(dir.path().join("top.md"), "top level note").unwrap();
        init_repo(&dir.path().join("vendor/lib"));

        let config: Config = toml::from_str("[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n").unwrap();
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let cache_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let cache = ConvertCache::open(cache_pool).await.unwrap();
        let collection_id = get_or_create_collection(&pool, "proj", CollectionType::Project, None)
            .await
            .unwrap();
        let proj = project(vec![dir.path().to_path_buf()]);
        let mut visited = HashSet::new();

        let result = walk_and_delegate(
            &config,
            &pool,
            &cache,
            &collection_id,
            "proj",
            dir.path(),
            &proj,
            &mut visited,
            false,
        )
        .await
        .unwrap();

        assert_eq!(result.sources_indexed, 1, "only top.md should be indexed as a plain file");

        let paths: Vec<String> = sqlx::query_scalar("SELECT path FROM sources WHERE collection_id = ?")
            .bind(&collection_id)
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(paths.iter().any(|p| p == "top.md"));
        assert!(!paths.iter().any(|p| p.contains("README.md") && !p.starts_with("git://")));
    }
}
