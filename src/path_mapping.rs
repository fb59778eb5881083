//! Per-user path translation (`spec.md` §6).
//!
//! An authenticated caller may see the filesystem under different mount
//! points than the host does (e.g. a container bind-mount or a remote
//! editor's workspace root). `UserConfig::path_mappings` records host path
//! -> caller-visible path pairs; forward translation rewrites an outbound
//! host path into the caller's view, and reverse translation turns an
//! inbound caller-supplied path back into the host path before any
//! filesystem access. Unauthenticated (stdio) calls never go through this
//! module — see `mcp.rs`.

use std::path::{Path, PathBuf};

use crate::auth::UserContext;

/// Rewrite a host-side path into the caller's view, using the longest
/// matching host prefix. Paths with no matching mapping pass through
/// unchanged.
pub fn apply_forward(user: &UserContext, host_path: &str) -> String {
    match longest_prefix_match(&user.path_mappings, host_path, true) {
        Some((host_prefix, caller_prefix)) => {
            let suffix = &host_path[host_prefix.len()..];
            format!("{caller_prefix}{suffix}")
        }
        None => host_path.to_string(),
    }
}

/// Rewrite a caller-visible path back to the host path, using the longest
/// matching caller-visible prefix. Returns `host_path` unchanged if no
/// mapping applies — callers must still verify the result lies under an
/// allowed root before touching the filesystem.
pub fn apply_reverse(user: &UserContext, caller_path: &str) -> String {
    match longest_prefix_match(&user.path_mappings, caller_path, false) {
        Some((host_prefix, caller_prefix)) => {
            let suffix = &caller_path[caller_prefix.len()..];
            format!("{host_prefix}{suffix}")
        }
        None => caller_path.to_string(),
    }
}

/// Forward-translate a `file://` URI's path component, leaving
/// non-`file://` URIs (vault/editor/virtual schemes) untouched — those are
/// already caller-relative by construction.
pub fn apply_forward_uri(user: &UserContext, uri: &str) -> String {
    match uri.strip_prefix("file://") {
        Some(path) => format!("file://{}", apply_forward(user, path)),
        None => uri.to_string(),
    }
}

/// Find the mapping entry whose `match_host` side (host path when
/// `match_host` is true, caller path otherwise) is the longest prefix of
/// `candidate`. Longest-prefix-wins so a more specific mapping overrides a
/// broader one (e.g. a vault-scoped mapping overriding the home mapping).
fn longest_prefix_match<'a>(
    mappings: &'a std::collections::HashMap<String, String>,
    candidate: &str,
    match_host: bool,
) -> Option<(&'a str, &'a str)> {
    mappings
        .iter()
        .filter(|(host, caller)| {
            let needle = if match_host { host.as_str() } else { caller.as_str() };
            candidate.starts_with(needle)
        })
        .max_by_key(|(host, caller)| if match_host { host.len() } else { caller.len() })
        .map(|(host, caller)| (host.as_str(), caller.as_str()))
}

/// Resolve `path` to its canonical absolute form and check it lies under
/// one of `allowed_roots`. Used by the convert tool endpoint to reject
/// paths outside every configured vault/library/repo/home/global root
/// without disclosing the resolved path on failure (`spec.md` §7,
/// `PathNotAllowed`).
pub fn is_under_allowed_root(path: &Path, allowed_roots: &[PathBuf]) -> bool {
    let Ok(resolved) = path.canonicalize() else {
        return false;
    };
    allowed_roots.iter().any(|root| {
        root.canonicalize()
            .map(|root| resolved.starts_with(root))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn user_with_mapping(host: &str, caller: &str) -> UserContext {
        let mut path_mappings = HashMap::new();
        path_mappings.insert(host.to_string(), caller.to_string());
        UserContext {
            username: "alice".to_string(),
            system_collections: vec![],
            path_mappings,
        }
    }

    #[test]
    fn forward_rewrites_host_prefix_to_caller_view() {
        let user = user_with_mapping("/home/alice/notes", "/workspace");
        assert_eq!(
            apply_forward(&user, "/home/alice/notes/today.md"),
            "/workspace/today.md"
        );
    }

    #[test]
    fn reverse_rewrites_caller_prefix_back_to_host_path() {
        let user = user_with_mapping("/home/alice/notes", "/workspace");
        assert_eq!(
            apply_reverse(&user, "/workspace/today.md"),
            "/home/alice/notes/today.md"
        );
    }

    #[test]
    fn unmapped_path_passes_through_unchanged() {
        let user = user_with_mapping("/home/alice/notes", "/workspace");
        assert_eq!(apply_forward(&user, "/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn forward_uri_only_rewrites_file_scheme() {
        let user = user_with_mapping("/home/alice/notes", "/workspace");
        assert_eq!(
            apply_forward_uri(&user, "file:///home/alice/notes/a.md"),
            "file:///workspace/a.md"
        );
        assert_eq!(apply_forward_uri(&user, "git://repo#abc123"), "git://repo#abc123");
    }

    #[test]
    fn longest_prefix_wins_over_a_broader_mapping() {
        let mut path_mappings = HashMap::new();
        path_mappings.insert("/home/alice".to_string(), "/ws-home".to_string());
        path_mappings.insert("/home/alice/vault".to_string(), "/ws-vault".to_string());
        let user = UserContext {
            username: "alice".to_string(),
            system_collections: vec![],
            path_mappings,
        };
        assert_eq!(
            apply_forward(&user, "/home/alice/vault/daily.md"),
            "/ws-vault/daily.md"
        );
        assert_eq!(apply_forward(&user, "/home/alice/other.md"), "/ws-home/other.md");
    }
}
