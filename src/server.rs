//! Authenticated HTTP tool endpoint (`spec.md` §6).
//!
//! The networked counterpart to `mcp.rs`'s stdio bridge: every request
//! carries a bearer token, resolved through [`crate::auth::TokenVerifier`]
//! to a [`crate::auth::UserContext`], whose `path_mappings` then translate
//! paths in both directions — forward on the way out (search results),
//! reverse on the way in (convert requests) — before anything touches the
//! filesystem. A convert request whose reverse-translated path falls
//! outside every configured allowed root is rejected with a generic
//! message that does not disclose the resolved path.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{TokenVerifier, UserContext};
use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::error::HarnessError;
use crate::models::{IndexRequest, SearchFilters};
use crate::queue::IndexingQueue;
use crate::{path_mapping, search, sources};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    convert_cache: Arc<ConvertCache>,
    queue: IndexingQueue,
    verifier: Arc<TokenVerifier>,
}

/// Start the HTTP tool endpoint. Binds to `config.server.bind`.
pub async fn run_server(
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    convert_cache: Arc<ConvertCache>,
    queue: IndexingQueue,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let state = AppState {
        config,
        pool,
        convert_cache,
        queue,
        verifier: Arc::new(TokenVerifier::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/search", post(handle_search))
        .route("/tools/convert", post(handle_convert))
        .route("/tools/collections", get(handle_collections))
        .route("/tools/index", post(handle_index))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!("tool endpoint listening on http://{bind_addr}");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<HarnessError> for AppError {
    fn from(e: HarnessError) -> Self {
        let status = match &e {
            HarnessError::EmbeddingUnreachable(_) => StatusCode::BAD_GATEWAY,
            HarnessError::PathNotAllowed => StatusCode::FORBIDDEN,
            HarnessError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            HarnessError::DocumentLocked(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

/// Extract and verify the bearer token from `Authorization: Bearer <token>`.
/// Returns `None` when the header is absent entirely — callers treat that
/// as an unauthenticated request, which for this HTTP transport is itself
/// an error (unlike stdio, which has no header to omit).
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserContext, AppError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing Authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| bad_request("Authorization header must be a Bearer token"))?;

    state.verifier.verify(&state.config, token).map_err(AppError::from)
}

/// Every configured root a convert request may resolve into.
fn allowed_roots(config: &Config) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    roots.extend(config.home.iter().cloned());
    roots.extend(config.global_paths.iter().cloned());
    roots.extend(config.obsidian_vaults.iter().cloned());
    roots.extend(config.calibre_libraries.iter().cloned());
    for project in config.projects.values() {
        roots.extend(project.roots.iter().cloned());
    }
    for group_roots in config.code_groups.values() {
        roots.extend(group_roots.iter().cloned());
    }
    roots
}

// ============ POST /tools/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    collection: Option<String>,
    #[serde(default = "default_top_k")]
    top_k: i64,
    source_type: Option<String>,
    date_from: Option<chrono::DateTime<chrono::Utc>>,
    date_to: Option<chrono::DateTime<chrono::Utc>>,
    sender: Option<String>,
    author: Option<String>,
}

fn default_top_k() -> i64 {
    10
}

#[derive(Serialize)]
struct SearchResultPayload {
    title: String,
    content: String,
    collection: String,
    source_type: String,
    source_path: String,
    source_uri: Option<String>,
    score: f64,
    stale: bool,
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Serialize)]
struct IndexingSummary {
    active: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResultPayload>,
    indexing: IndexingSummary,
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let user = authenticate(&state, &headers)?;

    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let filters = SearchFilters {
        collection: req.collection,
        source_type: req.source_type,
        sender: req.sender,
        author: req.author,
        date_from: req.date_from,
        date_to: req.date_to,
        ..SearchFilters::default()
    };

    let results = search::hybrid_search(&state.pool, &state.config, &req.query, req.top_k, &filters).await?;
    let indexing_active = state.queue.status_board().is_indexing();

    let payload = results
        .iter()
        .map(|r| SearchResultPayload {
            title: r.heading_path.clone().unwrap_or_else(|| r.path.clone()),
            content: r.snippet.clone(),
            collection: r.collection_name.clone(),
            source_type: r.source_type.clone(),
            source_path: path_mapping::apply_forward(&user, &r.path),
            source_uri: search::derive_source_uri(r).map(|uri| path_mapping::apply_forward_uri(&user, &uri)),
            score: r.score,
            stale: r.stale,
            metadata: r.metadata.clone(),
        })
        .collect();

    Ok(Json(SearchResponse {
        results: payload,
        indexing: IndexingSummary { active: indexing_active },
    }))
}

// ============ POST /tools/convert ============

#[derive(Deserialize)]
struct ConvertRequest {
    file_path: String,
}

#[derive(Serialize)]
struct ConvertResponse {
    content: String,
}

async fn handle_convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConvertRequest>,
) -> Result<Json<ConvertResponse>, AppError> {
    let user = authenticate(&state, &headers)?;

    let host_path = path_mapping::apply_reverse(&user, &req.file_path);
    let resolved = PathBuf::from(&host_path);
    let roots = allowed_roots(&state.config);

    if !path_mapping::is_under_allowed_root(&resolved, &roots) {
        return Err(AppError::from(HarnessError::PathNotAllowed));
    }

    let markdown = crate::indexers::convert_path_to_markdown(&state.convert_cache, &state.config, &resolved)
        .await
        .map_err(AppError::from)?;

    Ok(Json(ConvertResponse { content: markdown }))
}

// ============ GET /tools/collections ============

#[derive(Serialize)]
struct CollectionsResponse {
    sources: Vec<sources::SourceStatus>,
}

async fn handle_collections(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<CollectionsResponse>, AppError> {
    authenticate(&state, &headers)?;
    Ok(Json(CollectionsResponse {
        sources: sources::get_sources(&state.config),
    }))
}

// ============ POST /tools/index ============

#[derive(Deserialize)]
struct IndexTriggerRequest {
    collection: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn handle_index(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IndexTriggerRequest>,
) -> Result<Json<crate::models::IndexResult>, AppError> {
    authenticate(&state, &headers)?;

    let request = match req.collection {
        Some(name) => IndexRequest::Collection { name, force: req.force },
        None => IndexRequest::All { force: req.force },
    };
    let result = state.queue.submit_and_wait(request).await?;
    Ok(Json(result))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_roots_collects_every_configured_root_kind() {
        let config: Config = toml::from_str(
            "home = \"/home/alice\"\nglobal_paths = [\"/srv/shared\"]\nobsidian_vaults = [\"/vaults/main\"]\ncalibre_libraries = [\"/books\"]\n[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n",
        )
        .unwrap();
        let roots = allowed_roots(&config);
        assert!(roots.contains(&PathBuf::from("/home/alice")));
        assert!(roots.contains(&PathBuf::from("/srv/shared")));
        assert!(roots.contains(&PathBuf::from("/vaults/main")));
        assert!(roots.contains(&PathBuf::from("/books")));
    }

    #[tokio::test]
    async fn missing_authorization_header_is_rejected() {
        let config: Config = toml::from_str("[chunking]\nmax_tokens = 400\n[server]\nbind = \"127.0.0.1:0\"\n").unwrap();
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let cache = ConvertCache::open(pool.clone()).await.unwrap();
        let queue = IndexingQueue::spawn(Arc::new(config.clone()), pool.clone(), Arc::new(cache));
        let cache_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let state = AppState {
            config: Arc::new(config),
            pool,
            convert_cache: Arc::new(ConvertCache::open(cache_pool).await.unwrap()),
            queue,
            verifier: Arc::new(TokenVerifier::new()),
        };

        let result = authenticate(&state, &HeaderMap::new());
        assert!(result.is_err());
    }
}
