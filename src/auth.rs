//! Bearer-token authentication for the networked transport (`spec.md` §6).
//!
//! Unauthenticated (stdio) callers bypass this entirely — see `mcp.rs` and
//! `server.rs`, which only consult this module for the HTTP/MCP-over-TCP
//! path. A caller presents a bearer token; this module resolves it to the
//! configured username or reports `RateLimited` after repeated failures
//! from the same token, mirroring the teacher's token-verifier backoff.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{HarnessError, Result};

const MAX_FAILURES_BEFORE_BACKOFF: u32 = 5;
const BACKOFF_SECS: u64 = 30;

/// The resolved identity of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub username: String,
    pub system_collections: Vec<String>,
    pub path_mappings: HashMap<String, String>,
}

struct FailureRecord {
    count: u32,
    last_failure: Instant,
}

/// Tracks per-token authentication failures so repeated bad tokens get
/// backed off rather than retried at full speed — the authentication
/// subsystem's own rate limit, distinct from any transport-level one.
#[derive(Default)]
pub struct TokenVerifier {
    failures: Mutex<HashMap<String, FailureRecord>>,
}

impl TokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `token` against `config.users[*].token`. Returns
    /// `RateLimited` if this token has failed too many times recently,
    /// `Other` for an unknown token.
    pub fn verify(&self, config: &Config, token: &str) -> Result<UserContext> {
        if let Some(record) = self.failures.lock().unwrap().get(token) {
            if record.count >= MAX_FAILURES_BEFORE_BACKOFF {
                let elapsed = record.last_failure.elapsed();
                let backoff = Duration::from_secs(BACKOFF_SECS);
                if elapsed < backoff {
                    return Err(HarnessError::RateLimited {
                        retry_after_secs: (backoff - elapsed).as_secs(),
                    });
                }
            }
        }

        for (username, user) in &config.users {
            if user.token.as_deref() == Some(token) {
                self.failures.lock().unwrap().remove(token);
                return Ok(UserContext {
                    username: username.clone(),
                    system_collections: user.system_collections.clone(),
                    path_mappings: user.path_mappings.clone(),
                });
            }
        }

        self.record_failure(token);
        Err(HarnessError::Other(anyhow::anyhow!("unknown bearer token")))
    }

    fn record_failure(&self, token: &str) {
        let mut failures = self.failures.lock().unwrap();
        let record = failures.entry(token.to_string()).or_insert(FailureRecord {
            count: 0,
            last_failure: Instant::now(),
        });
        record.count += 1;
        record.last_failure = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;

    fn config_with_user(username: &str, token: &str) -> Config {
        let mut config: Config = toml::from_str("[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n").unwrap();
        config.users.insert(
            username.to_string(),
            UserConfig {
                system_collections: vec!["obsidian".to_string()],
                path_mappings: HashMap::new(),
                token: Some(token.to_string()),
            },
        );
        config
    }

    #[test]
    fn known_token_resolves_to_its_username() {
        let config = config_with_user("alice", "secret-token");
        let verifier = TokenVerifier::new();
        let ctx = verifier.verify(&config, "secret-token").unwrap();
        assert_eq!(ctx.username, "alice");
        assert_eq!(ctx.system_collections, vec!["obsidian".to_string()]);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let config = config_with_user("alice", "secret-token");
        let verifier = TokenVerifier::new();
        let err = verifier.verify(&config, "wrong-token").unwrap_err();
        assert!(matches!(err, HarnessError::Other(_)));
    }

    #[test]
    fn repeated_failures_trigger_rate_limiting() {
        let config = config_with_user("alice", "secret-token");
        let verifier = TokenVerifier::new();
        for _ in 0..MAX_FAILURES_BEFORE_BACKOFF {
            let _ = verifier.verify(&config, "wrong-token");
        }
        let err = verifier.verify(&config, "wrong-token").unwrap_err();
        assert!(matches!(err, HarnessError::RateLimited { .. }));
    }
}
