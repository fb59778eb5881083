//! Git repository indexer.
//!
//! Indexes one or more local repositories belonging to a named code group
//! in two passes, kept in disjoint path namespaces so pruning one never
//! touches the other:
//!
//! - the current tree (`git ls-files`, respecting `.gitignore` plus
//!   `git.exclude_globs`), one [`SourceItem`] per file, structurally split
//!   on function/type boundaries by [`super::code_blocks`] rather than
//!   paragraphs. Paths are `git://<repo_abs>#<head_sha>:<file>`; a per-repo
//!   HEAD-sha watermark (persisted in the collection's `description` as a
//!   `{repo_abs: sha}` JSON map) lets an unchanged repo skip `ls-files` and
//!   every file read entirely.
//! - commit history (`git log --no-merges`, last `git.history_in_months`
//!   months) when `git.index_history` is enabled: one `SourceItem` per file
//!   touched by each commit, carrying that file's own diff hunk rather than
//!   the whole commit's. Paths are `git://<repo_abs>@history#<sha>:<file>`.
//!
//! Repositories are expected to already exist on disk (cloned by the
//! user); this indexer never clones or fetches.

use chrono::{DateTime, Months, Utc};
use globset::{Glob, GlobSetBuilder};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::error::Result;
use crate::indexers::code_blocks;
use crate::indexers::{get_or_create_collection, sync_items};
use crate::models::{CollectionType, IndexResult, SourceItem};

pub async fn run(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    group_name: &str,
    force: bool,
) -> Result<IndexResult> {
    let repos = config
        .code_groups
        .get(group_name)
        .ok_or_else(|| anyhow::anyhow!("unknown code group: {group_name}"))?;

    let collection_id =
        get_or_create_collection(pool, group_name, CollectionType::Code, Some("git-code")).await?;

    let mut combined = IndexResult::default();
    for repo in repos {
        if !repo.join(".git").exists() {
            continue;
        }
        combined.merge(run_one(config, pool, convert_cache, &collection_id, group_name, repo, force).await?);
    }

    Ok(combined)
}

/// Index a single repository into an already-resolved `collection_id`.
/// Used directly by [`run`] for each repo in a code group, and by
/// `project.rs` to delegate a project sub-directory that turns out to be
/// its own git checkout.
pub async fn run_one(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    collection_id: &str,
    collection_name: &str,
    repo: &Path,
    force: bool,
) -> Result<IndexResult> {
    let repo_abs = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
    let repo_key = repo_abs.to_string_lossy().to_string();
    let head_sha = git_head_sha(&repo_abs);

    let mut watermarks = load_watermarks(pool, collection_id).await?;
    let unchanged = !force
        && head_sha
            .as_ref()
            .map(|sha| watermarks.get(&repo_key) == Some(sha))
            .unwrap_or(false);

    let code_scope = format!("git://{}#", repo_abs.display());
    let code_result = if unchanged {
        IndexResult::default()
    } else {
        let items = discover_code(
            collection_name,
            &repo_abs,
            &config.git.exclude_globs,
            config.chunking.max_tokens,
            config.chunking.overlap_words,
        )?;
        sync_items(config, pool, convert_cache, collection_id, items, Some(&code_scope), force).await?
    };

    let mut combined = code_result;

    if config.git.index_history {
        let history_scope = format!("git://{}@history#", repo_abs.display());
        let history_items = discover_history(
            collection_name,
            &repo_abs,
            config.git.history_in_months,
            &config.git.history_subject_blacklist,
        )?;
        combined.merge(
            sync_items(config, pool, convert_cache, collection_id, history_items, Some(&history_scope), force).await?,
        );
    }

    if let Some(sha) = head_sha {
        watermarks.insert(repo_key, sha);
        save_watermarks(pool, collection_id, &watermarks).await?;
    }

    Ok(combined)
}

async fn load_watermarks(pool: &sqlx::SqlitePool, collection_id: &str) -> Result<HashMap<String, String>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT description FROM collections WHERE id = ?")
        .bind(collection_id)
        .fetch_optional(pool)
        .await?
        .flatten();
    Ok(raw
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default())
}

async fn save_watermarks(pool: &sqlx::SqlitePool, collection_id: &str, watermarks: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string(watermarks).map_err(anyhow::Error::from)?;
    sqlx::query("UPDATE collections SET description = ? WHERE id = ?")
        .bind(json)
        .bind(collection_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn git_head_sha(repo: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn discover_code(
    collection_name: &str,
    repo_abs: &Path,
    exclude_globs: &[String],
    max_tokens: usize,
    overlap_words: usize,
) -> Result<Vec<SourceItem>> {
    let output = Command::new("git")
        .args(["ls-files"])
        .current_dir(repo_abs)
        .output()
        .map_err(anyhow::Error::from)?;
    if !output.status.success() {
        anyhow::bail!(
            "git ls-files failed in {}: {}",
            repo_abs.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in exclude_globs {
        builder.add(Glob::new(pattern)?);
    }
    let exclude_set = builder.build()?;

    let head_sha = git_head_sha(repo_abs).unwrap_or_else(|| "unknown".to_string());

    let mut items = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let rel_path = line.trim();
        if rel_path.is_empty() || exclude_set.is_match(rel_path) {
            continue;
        }
        let full_path = repo_abs.join(rel_path);
        let body = match std::fs::read_to_string(&full_path) {
            Ok(b) => b,
            Err(_) => continue, // binary or unreadable; skip
        };
        let fs_metadata = std::fs::metadata(&full_path).ok();
        let mtime = fs_metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        let extension = Path::new(rel_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let pieces = code_blocks::chunk_source_file(&body, rel_path, &extension, max_tokens, overlap_words);

        let path = format!("git://{}#{}:{}", repo_abs.display(), head_sha, rel_path);
        let mut metadata = HashMap::new();
        metadata.insert("path".to_string(), rel_path.to_string());

        items.push(SourceItem {
            collection_name: collection_name.to_string(),
            collection_type: CollectionType::Code,
            path,
            title: Some(rel_path.to_string()),
            content_type: "text/x-source-code".to_string(),
            source_type: "source-file".to_string(),
            body,
            raw_bytes: None,
            mtime,
            size: fs_metadata.map(|m| m.len() as i64),
            metadata,
            pre_chunked: Some(pieces),
        });
    }

    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

fn discover_history(
    collection_name: &str,
    repo_abs: &Path,
    months: i64,
    subject_blacklist: &[String],
) -> Result<Vec<SourceItem>> {
    let since = Utc::now()
        .checked_sub_months(Months::new(months.max(0) as u32))
        .unwrap_or_else(Utc::now);

    const RECORD_SEP: &str = "\x1e";
    let format = format!("%H{RECORD_SEP}%an{RECORD_SEP}%ct{RECORD_SEP}%s{RECORD_SEP}%b%x00");

    let output = Command::new("git")
        .args([
            "log",
            "--no-merges",
            &format!("--since={}", since.format("%Y-%m-%d")),
            &format!("--format={format}"),
        ])
        .current_dir(repo_abs)
        .output()
        .map_err(anyhow::Error::from)?;
    if !output.status.success() {
        return Ok(Vec::new());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut items = Vec::new();

    for record in stdout.split('\0') {
        let record = record.trim_start_matches(['\n', '\r']);
        let fields: Vec<&str> = record.splitn(5, RECORD_SEP).collect();
        if fields.len() < 5 {
            continue;
        }
        let (sha, author, ts, subject, body) = (fields[0], fields[1], fields[2], fields[3], fields[4].trim());
        if sha.is_empty() {
            continue;
        }
        if subject_blacklist.iter().any(|p| subject.starts_with(p.as_str())) {
            continue;
        }

        let commit_ts: i64 = ts.parse().unwrap_or(0);
        let date_str = DateTime::<Utc>::from_timestamp(commit_ts, 0)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();

        let diff_output = match Command::new("git")
            .args(["show", "--no-color", "--format=", sha])
            .current_dir(repo_abs)
            .output()
        {
            Ok(o) if o.status.success() => o,
            _ => continue,
        };
        let diff_text = String::from_utf8_lossy(&diff_output.stdout).to_string();

        for (file, diff) in per_file_diffs(&diff_text) {
            let text = format!("{subject}\n\n{body}\n\n{diff}");
            let path = format!("git://{}@history#{}:{}", repo_abs.display(), sha, file);

            let mut metadata = HashMap::new();
            metadata.insert("author".to_string(), author.to_string());
            metadata.insert("date".to_string(), date_str.clone());
            metadata.insert("file".to_string(), file.clone());
            metadata.insert("sha".to_string(), sha.to_string());

            items.push(SourceItem {
                collection_name: collection_name.to_string(),
                collection_type: CollectionType::Code,
                path,
                title: Some(format!("{subject} ({file})")),
                content_type: "text/x-git-commit".to_string(),
                source_type: "commit".to_string(),
                body: text,
                raw_bytes: None,
                mtime: Some(commit_ts),
                size: None,
                metadata,
                pre_chunked: None,
            });
        }
    }

    Ok(items)
}

/// Split `git show`'s unified diff output into `(file, diff_for_that_file)`
/// pairs, keyed on the `diff --git a/<path> b/<path>` header each file's
/// hunk starts with.
fn per_file_diffs(diff_text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git a/") {
            if let Some(entry) = current.take() {
                result.push(entry);
            }
            let file = rest.split(" b/").next().unwrap_or(rest).to_string();
            current = Some((file, format!("{line}\n")));
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some(entry) = current.take() {
        result.push(entry);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_file_diffs_splits_on_file_headers() {
        let diff = "diff --git a/src/a.rs b/src/a.rs\nindex 111..222 100644\n--- a/src/a.rs\n+++ b/src/a.rs\n@@ -1 +1 @@\n-old\n+new\ndiff --git a/src/b.rs b/src/b.rs\nindex 333..444 100644\n--- a/src/b.rs\n+++ b/src/b.rs\n@@ -1 +1 @@\n-foo\n+bar\n";
        let files = per_file_diffs(diff);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, "src/a.rs");
        assert!(files[0].1.contains("-old"));
        assert_eq!(files[1].0, "src/b.rs");
        assert!(files[1].1.contains("+bar"));
    }

    #[test]
    fn per_file_diffs_handles_empty_input() {
        assert!(per_file_diffs("").is_empty());
    }
}
