//! Obsidian vault indexer.
//!
//! Each configured vault becomes its own `vault`-typed collection (named
//! after the vault's directory), walking Markdown files while skipping
//! Obsidian's own `.obsidian` folder and any user-configured exclude
//! folders. YAML front matter, inline `#tag`s, and `[[wikilink]]`s are
//! parsed out of each note and folded into its metadata, so search filters
//! and snippets can surface them without re-parsing the body.

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::chunk::{extract_front_matter, extract_inline_tags, extract_wikilinks};
use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::error::Result;
use crate::indexers::{get_or_create_collection, sync_items};
use crate::models::{CollectionType, IndexResult, SourceItem};

pub async fn run(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    force: bool,
) -> Result<IndexResult> {
    let mut combined = IndexResult::default();

    for vault_path in &config.obsidian_vaults {
        if !vault_path.exists() {
            combined
                .errors
                .push(format!("vault path does not exist: {}", vault_path.display()));
            continue;
        }

        let name = vault_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| vault_path.to_string_lossy().to_string());

        let collection_id =
            get_or_create_collection(pool, &name, CollectionType::Vault, Some("obsidian-vault")).await?;

        combined.merge(
            run_one(
                config,
                pool,
                convert_cache,
                &collection_id,
                &name,
                vault_path,
                &config.obsidian_exclude_folders,
                None,
                force,
            )
            .await?,
        );
    }

    Ok(combined)
}

/// Index a single vault directory into an already-resolved
/// `collection_id`. Used directly by [`run`] for each configured vault,
/// and by `project.rs` to delegate a project sub-directory that turns out
/// to be its own Obsidian vault (`.obsidian` marker present).
#[allow(clippy::too_many_arguments)]
pub async fn run_one(
    config: &Config,
    pool: &sqlx::SqlitePool,
    convert_cache: &ConvertCache,
    collection_id: &str,
    collection_name: &str,
    vault_path: &std::path::Path,
    exclude_folders: &[String],
    prune_scope: Option<&str>,
    force: bool,
) -> Result<IndexResult> {
    let mut items = discover(collection_name, vault_path, exclude_folders)?;
    if let Some(prefix) = prune_scope {
        for item in &mut items {
            item.path = format!("{prefix}{}", item.path);
        }
    }
    sync_items(config, pool, convert_cache, collection_id, items, prune_scope, force).await
}

fn discover(
    collection_name: &str,
    vault_path: &std::path::Path,
    exclude_folders: &[String],
) -> Result<Vec<SourceItem>> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new("**/.obsidian/**")?);
    builder.add(Glob::new("**/.trash/**")?);
    for folder in exclude_folders {
        builder.add(Glob::new(&format!("**/{folder}/**"))?);
    }
    let exclude_set: GlobSet = builder.build()?;

    let mut items = Vec::new();

    for entry in WalkDir::new(vault_path) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }

        let relative = path.strip_prefix(vault_path).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if exclude_set.is_match(&rel_str) {
            continue;
        }

        let body = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let fs_metadata = std::fs::metadata(path)?;
        let mtime = fs_metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        let (front_matter, stripped_body) = extract_front_matter(&body);
        let tags = extract_inline_tags(&body);
        let wikilinks = extract_wikilinks(&body);

        let file_stem = path.file_stem().map(|s| s.to_string_lossy().to_string());
        let title = front_matter
            .as_ref()
            .and_then(|fm| fm.title.clone())
            .or_else(|| file_stem.clone());

        let mut metadata = std::collections::HashMap::new();
        if let Some(fm) = &front_matter {
            metadata.extend(fm.fields.clone());
            let mut all_tags = fm.tags.clone();
            all_tags.extend(tags);
            all_tags.sort();
            all_tags.dedup();
            if !all_tags.is_empty() {
                metadata.insert("tags".to_string(), all_tags.join(","));
            }
        } else if !tags.is_empty() {
            metadata.insert("tags".to_string(), tags.join(","));
        }
        if !wikilinks.is_empty() {
            metadata.insert("wikilinks".to_string(), wikilinks.join(","));
        }

        items.push(SourceItem {
            collection_name: collection_name.to_string(),
            collection_type: CollectionType::Vault,
            path: rel_str.clone(),
            title,
            content_type: "text/markdown".to_string(),
            source_type: "markdown".to_string(),
            body: stripped_body.to_string(),
            raw_bytes: None,
            mtime,
            size: Some(fs_metadata.len() as i64),
            metadata,
            pre_chunked: None,
        });
    }

    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn discover_parses_front_matter_tags_and_wikilinks() {
        let dir = tempfile::tempdir().unwrap();
        let note_path = dir.path().join("note.md");
        let mut file = std::fs::File::create(&note_path).unwrap();
        writeln!(
            file,
            "---\ntitle: My Note\ntags: [alpha]\n---\nBody referencing #beta and [[Other Note]]."
        )
        .unwrap();
        drop(file);

        let items = discover("vault", dir.path(), &[]).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title.as_deref(), Some("My Note"));
        assert_eq!(items[0].metadata.get("tags"), Some(&"alpha,beta".to_string()));
        assert_eq!(items[0].metadata.get("wikilinks"), Some(&"Other Note".to_string()));
        assert!(!items[0].body.contains("title: My Note"));
    }
}
