//! Collection configuration and health listing.
//!
//! Reports which collections are configured and whether their backing
//! storage is reachable, without touching the index store — used by both
//! the `ctx sources` CLI command and the `list_collections` tool endpoint
//! (`spec.md` §6).

use serde::Serialize;

use crate::config::Config;
use crate::models::CollectionType;

/// Configuration and health status of a single configured collection.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub collection_type: CollectionType,
    pub configured: bool,
    pub healthy: bool,
    pub notes: Option<String>,
}

fn dir_status(name: &str, collection_type: CollectionType, path: &std::path::Path) -> SourceStatus {
    if path.exists() {
        SourceStatus {
            name: name.to_string(),
            collection_type,
            configured: true,
            healthy: true,
            notes: None,
        }
    } else {
        SourceStatus {
            name: name.to_string(),
            collection_type,
            configured: true,
            healthy: false,
            notes: Some(format!("{} does not exist", path.display())),
        }
    }
}

/// Returns the configuration and health status of every collection this
/// config enables.
pub fn get_sources(config: &Config) -> Vec<SourceStatus> {
    let mut sources = Vec::new();

    if let Some(home) = &config.home {
        sources.push(dir_status("home", CollectionType::Project, home));
    }
    for root in &config.global_paths {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.to_string_lossy().to_string());
        sources.push(dir_status(&name, CollectionType::Project, root));
    }
    for (name, project) in &config.projects {
        let root_ok = project.roots.iter().all(|r| r.exists());
        sources.push(SourceStatus {
            name: name.clone(),
            collection_type: CollectionType::Project,
            configured: true,
            healthy: root_ok,
            notes: if root_ok {
                None
            } else {
                Some("one or more configured roots do not exist".to_string())
            },
        });
    }

    for vault in &config.obsidian_vaults {
        let name = vault
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| vault.to_string_lossy().to_string());
        sources.push(dir_status(&name, CollectionType::Vault, vault));
    }

    if !config.code_groups.is_empty() {
        let git_available = std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        for (name, roots) in &config.code_groups {
            let healthy = git_available && roots.iter().all(|r| r.exists());
            sources.push(SourceStatus {
                name: name.clone(),
                collection_type: CollectionType::Code,
                configured: true,
                healthy,
                notes: if !git_available {
                    Some("git binary not found".to_string())
                } else if !healthy {
                    Some("one or more configured repos do not exist".to_string())
                } else {
                    None
                },
            });
        }
    }

    for library in &config.calibre_libraries {
        let name = library
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| library.to_string_lossy().to_string());
        sources.push(dir_status(&format!("calibre-{name}"), CollectionType::Calibre, library));
    }

    match &config.email {
        Some(email) => sources.push(dir_status("email", CollectionType::Email, &email.db_path)),
        None => sources.push(SourceStatus {
            name: "email".to_string(),
            collection_type: CollectionType::Email,
            configured: false,
            healthy: false,
            notes: None,
        }),
    }

    match &config.rss {
        Some(rss) => sources.push(dir_status("rss", CollectionType::Rss, &rss.db_path)),
        None => sources.push(SourceStatus {
            name: "rss".to_string(),
            collection_type: CollectionType::Rss,
            configured: false,
            healthy: false,
            notes: None,
        }),
    }

    sources
}

/// CLI entry point for `ctx sources`.
pub fn list_sources(config: &Config) {
    let sources = get_sources(config);

    println!("{:<24} {:<10} {:<14} HEALTHY", "COLLECTION", "TYPE", "STATUS");
    for s in &sources {
        let status_str = if s.configured { "OK" } else { "NOT CONFIGURED" };
        println!(
            "{:<24} {:<10} {:<14} {}",
            s.name,
            s.collection_type.as_str(),
            status_str,
            s.healthy
        );
        if let Some(notes) = &s.notes {
            println!("    {notes}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_collections_are_reported_not_configured() {
        let config: Config = toml::from_str("[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n").unwrap();
        let sources = get_sources(&config);
        let email = sources.iter().find(|s| s.name == "email").unwrap();
        assert!(!email.configured);
        let rss = sources.iter().find(|s| s.name == "rss").unwrap();
        assert!(!rss.configured);
    }

    #[test]
    fn missing_obsidian_vault_is_reported_unhealthy() {
        let config: Config = toml::from_str(
            "obsidian_vaults = [\"/nonexistent/vault/path\"]\n[server]\nbind = \"127.0.0.1:0\"\n",
        )
        .unwrap();
        let sources = get_sources(&config);
        let vault = sources.iter().find(|s| s.collection_type == CollectionType::Vault).unwrap();
        assert!(!vault.healthy);
    }
}
