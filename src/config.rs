//! Configuration parsing and validation.
//!
//! The harness is configured via a TOML file (default: `./config/ctx.toml`).
//! The config defines per-group database paths, the shared conversion-cache
//! path, chunking parameters, embedding provider settings, hybrid-search
//! fusion weights, the source collections to index (home directory, global
//! paths, Obsidian vaults, git code groups, calibre libraries, email and
//! RSS stores, ad-hoc project folders), per-user path mappings, and watcher
//! debounce intervals.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_group_name")]
    pub group_name: String,
    #[serde(default = "default_group_db_dir")]
    pub group_db_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_shared_db_path")]
    pub shared_db_path: PathBuf,

    #[serde(default)]
    pub home: Option<PathBuf>,
    #[serde(default)]
    pub global_paths: Vec<PathBuf>,

    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search_defaults: SearchDefaults,

    #[serde(default)]
    pub obsidian_vaults: Vec<PathBuf>,
    #[serde(default)]
    pub obsidian_exclude_folders: Vec<String>,

    #[serde(default)]
    pub code_groups: HashMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub git: GitIndexingConfig,

    #[serde(default)]
    pub calibre_libraries: Vec<PathBuf>,
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub rss: Option<RssConfig>,

    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,

    #[serde(default)]
    pub users: HashMap<String, UserConfig>,

    #[serde(default)]
    pub watcher: WatcherConfig,

    pub server: ServerConfig,
}

fn default_group_name() -> String {
    "default".to_string()
}
fn default_group_db_dir() -> PathBuf {
    PathBuf::from("./data/groups")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/index.db")
}
fn default_shared_db_path() -> PathBuf {
    PathBuf::from("./data/shared/doc-store.db")
}

impl Config {
    /// Resolve the per-user index store path: the default group uses
    /// `db_path` directly (backwards compatible with a single-user setup);
    /// named groups live under `group_db_dir/<group>/index.db`.
    pub fn group_index_db_path(&self) -> PathBuf {
        if self.group_name != "default" {
            self.group_db_dir.join(&self.group_name).join("index.db")
        } else {
            self.db_path.clone()
        }
    }

    pub fn is_collection_enabled(&self, name: &str) -> bool {
        match name {
            "obsidian" => !self.obsidian_vaults.is_empty(),
            "email" => self.email.is_some(),
            "calibre" => !self.calibre_libraries.is_empty(),
            "rss" => self.rss.is_some(),
            other => self.code_groups.contains_key(other) || self.projects.contains_key(other),
        }
    }

    pub fn with_overrides(&self, group_name: String) -> Config {
        let mut cfg = self.clone();
        cfg.group_name = group_name;
        cfg
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

fn default_overlap_words() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 32,
            max_retries: 5,
            timeout_secs: 300,
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    300
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Reciprocal rank fusion weights and constant. Defaults match the
/// retrieval system this crate was distilled from (`rrf_k = 60`,
/// `vector_weight = 0.7`, `fts_weight = 0.3`).
#[derive(Debug, Deserialize, Clone)]
pub struct SearchDefaults {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: i64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_fts_weight")]
    pub fts_weight: f64,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            vector_weight: default_vector_weight(),
            fts_weight: default_fts_weight(),
        }
    }
}

fn default_rrf_k() -> i64 {
    60
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_fts_weight() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitIndexingConfig {
    #[serde(default = "default_history_months")]
    pub history_in_months: i64,
    #[serde(default)]
    pub index_history: bool,
    #[serde(default = "default_history_blacklist")]
    pub history_subject_blacklist: Vec<String>,
    /// Glob patterns (relative to the repo root) excluded from the
    /// current-tree scan in addition to whatever `.gitignore` already
    /// keeps out of `git ls-files` (vendored dependency dumps, generated
    /// assets checked in despite being ignorable).
    #[serde(default = "default_git_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

impl Default for GitIndexingConfig {
    fn default() -> Self {
        Self {
            history_in_months: default_history_months(),
            index_history: false,
            history_subject_blacklist: default_history_blacklist(),
            exclude_globs: default_git_exclude_globs(),
        }
    }
}

fn default_git_exclude_globs() -> Vec<String> {
    vec![
        "**/*.lock".to_string(),
        "**/vendor/**".to_string(),
        "**/dist/**".to_string(),
    ]
}

fn default_history_months() -> i64 {
    6
}
fn default_history_blacklist() -> Vec<String> {
    vec!["Merge ".to_string(), "chore(release)".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RssConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
        "**/*.epub".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UserConfig {
    /// Collections this user is allowed to see in addition to their own
    /// home collection (e.g. `["obsidian", "rustyquill"]`).
    #[serde(default)]
    pub system_collections: Vec<String>,
    /// Host path -> caller-visible path, applied forward to outbound
    /// results and reversed for inbound convert requests.
    #[serde(default)]
    pub path_mappings: HashMap<String, String>,
    /// Bearer token identifying this user over the authenticated transport.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_fs_debounce")]
    pub debounce_seconds: f64,
    #[serde(default = "default_system_debounce")]
    pub system_debounce_seconds: f64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_fs_debounce(),
            system_debounce_seconds: default_system_debounce(),
        }
    }
}

fn default_fs_debounce() -> f64 {
    2.0
}
fn default_system_debounce() -> f64 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if !(0.0..=1.0).contains(&config.search_defaults.vector_weight) {
        anyhow::bail!("search_defaults.vector_weight must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.search_defaults.fts_weight) {
        anyhow::bail!("search_defaults.fts_weight must be in [0.0, 1.0]");
    }
    if config.search_defaults.rrf_k < 1 {
        anyhow::bail!("search_defaults.rrf_k must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    for (name, project) in &config.projects {
        if project.roots.is_empty() {
            anyhow::bail!("projects.{name}.roots must not be empty");
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [chunking]
        max_tokens = 400

        [server]
        bind = "127.0.0.1:8787"
        "#
    }

    #[test]
    fn defaults_apply_when_sections_omitted() {
        let cfg: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(cfg.group_name, "default");
        assert_eq!(cfg.search_defaults.rrf_k, 60);
        assert!((cfg.search_defaults.vector_weight - 0.7).abs() < 1e-9);
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn group_index_db_path_uses_db_path_for_default_group() {
        let cfg: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(cfg.group_index_db_path(), cfg.db_path);
    }

    #[test]
    fn group_index_db_path_uses_group_dir_for_named_group() {
        let mut cfg: Config = toml::from_str(minimal_toml()).unwrap();
        cfg.group_name = "personal".to_string();
        cfg.group_db_dir = PathBuf::from("/tmp/groups");
        assert_eq!(
            cfg.group_index_db_path(),
            PathBuf::from("/tmp/groups/personal/index.db")
        );
    }

    #[test]
    fn rejects_out_of_range_fusion_weight() {
        let toml_str = format!(
            "{}\n[search_defaults]\nvector_weight = 1.5\n",
            minimal_toml()
        );
        let path = std::env::temp_dir().join(format!("ctx-test-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, toml_str).unwrap();
        let result = load_config(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn is_collection_enabled_reflects_config() {
        let mut cfg: Config = toml::from_str(minimal_toml()).unwrap();
        assert!(!cfg.is_collection_enabled("obsidian"));
        cfg.obsidian_vaults.push(PathBuf::from("/vault"));
        assert!(cfg.is_collection_enabled("obsidian"));
    }
}
