//! MCP tool endpoint (`spec.md` §6).
//!
//! Exposes the search/convert/list-collections/index surface as MCP tools
//! over stdio or streamable HTTP, generalizing the teacher's
//! `search`/`get`/`sources` bridge to this crate's `rag_search`/
//! `rag_convert`/`rag_list_collections`/`rag_index` tools. Callers reaching
//! this handler are unauthenticated by construction (stdio has no bearer
//! token to check), so path restriction and per-user path translation are
//! bypassed here; the HTTP transport in `server.rs` is where authenticated
//! callers go through `auth`/`path_mapping` first.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::json;

use crate::config::Config;
use crate::convert_cache::ConvertCache;
use crate::models::{IndexRequest, SearchFilters};
use crate::queue::IndexingQueue;

#[derive(Clone)]
pub struct McpBridge {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    convert_cache: Arc<ConvertCache>,
    queue: IndexingQueue,
}

impl McpBridge {
    pub fn new(
        config: Arc<Config>,
        pool: sqlx::SqlitePool,
        convert_cache: Arc<ConvertCache>,
        queue: IndexingQueue,
    ) -> Self {
        Self {
            config,
            pool,
            convert_cache,
            queue,
        }
    }

    fn tool_list() -> Vec<Tool> {
        vec![
            Tool {
                name: Cow::Borrowed("rag_search"),
                title: None,
                description: Some(Cow::Borrowed(
                    "Hybrid dense+lexical search over every indexed collection.",
                )),
                input_schema: Arc::new(
                    json!({
                        "type": "object",
                        "properties": {
                            "query": {"type": "string"},
                            "collection": {"type": "string"},
                            "top_k": {"type": "integer"},
                            "source_type": {"type": "string"},
                            "sender": {"type": "string"},
                            "author": {"type": "string"},
                            "date_from": {"type": "string", "format": "date-time"},
                            "date_to": {"type": "string", "format": "date-time"},
                        },
                        "required": ["query"]
                    })
                    .as_object()
                    .unwrap()
                    .clone(),
                ),
                output_schema: None,
                annotations: Some(ToolAnnotations::new().read_only(true)),
                execution: None,
                icons: None,
                meta: None,
            },
            Tool {
                name: Cow::Borrowed("rag_convert"),
                title: None,
                description: Some(Cow::Borrowed("Convert a file on disk to markdown text.")),
                input_schema: Arc::new(
                    json!({
                        "type": "object",
                        "properties": {"file_path": {"type": "string"}},
                        "required": ["file_path"]
                    })
                    .as_object()
                    .unwrap()
                    .clone(),
                ),
                output_schema: None,
                annotations: Some(ToolAnnotations::new().read_only(true)),
                execution: None,
                icons: None,
                meta: None,
            },
            Tool {
                name: Cow::Borrowed("rag_list_collections"),
                title: None,
                description: Some(Cow::Borrowed(
                    "List every configured collection and its health status.",
                )),
                input_schema: Arc::new(serde_json::Map::new()),
                output_schema: None,
                annotations: Some(ToolAnnotations::new().read_only(true)),
                execution: None,
                icons: None,
                meta: None,
            },
            Tool {
                name: Cow::Borrowed("rag_index"),
                title: None,
                description: Some(Cow::Borrowed(
                    "Trigger (re)indexing of one collection, or every collection if omitted.",
                )),
                input_schema: Arc::new(
                    json!({
                        "type": "object",
                        "properties": {
                            "collection": {"type": "string"},
                            "force": {"type": "boolean"},
                        },
                    })
                    .as_object()
                    .unwrap()
                    .clone(),
                ),
                output_schema: None,
                annotations: Some(ToolAnnotations::new().read_only(false)),
                execution: None,
                icons: None,
                meta: None,
            },
        ]
    }

    async fn call_rag_search(&self, args: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required field: query"))?;
        let top_k = args.get("top_k").and_then(|v| v.as_i64()).unwrap_or(10);

        let str_arg = |key: &str| args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());
        let date_arg = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc))
        };

        let filters = SearchFilters {
            collection: str_arg("collection"),
            source_type: str_arg("source_type"),
            sender: str_arg("sender"),
            author: str_arg("author"),
            date_from: date_arg("date_from"),
            date_to: date_arg("date_to"),
            ..SearchFilters::default()
        };

        let results = crate::search::hybrid_search(&self.pool, &self.config, query, top_k, &filters).await?;
        let indexing_active = self.queue.status_board().is_indexing();

        let payload: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                json!({
                    "title": r.heading_path.clone().unwrap_or_else(|| r.path.clone()),
                    "content": r.snippet,
                    "collection": r.collection_name,
                    "source_type": r.source_type,
                    "source_path": r.path,
                    "source_uri": crate::search::derive_source_uri(r),
                    "score": r.score,
                    "stale": r.stale,
                    "metadata": r.metadata,
                })
            })
            .collect();

        Ok(json!({
            "results": payload,
            "indexing": { "active": indexing_active },
        }))
    }

    async fn call_rag_convert(&self, args: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let file_path = args
            .get("file_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required field: file_path"))?;

        let markdown =
            crate::indexers::convert_path_to_markdown(&self.convert_cache, &self.config, std::path::Path::new(file_path))
                .await?;
        Ok(json!({ "content": markdown }))
    }

    fn call_rag_list_collections(&self) -> serde_json::Value {
        let sources = crate::sources::get_sources(&self.config);
        json!({ "sources": sources })
    }

    async fn call_rag_index(&self, args: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let force = args.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
        let request = match args.get("collection").and_then(|v| v.as_str()) {
            Some(name) => IndexRequest::Collection { name: name.to_string(), force },
            None => IndexRequest::All { force },
        };
        let result = self.queue.submit_and_wait(request).await?;
        Ok(serde_json::to_value(result)?)
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "context-harness".to_string(),
                title: Some("Context Harness".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Local retrieval-augmented search over your files, notes, code, books, mail, \
                 and feeds. rag_search finds relevant chunks; rag_convert renders a file to \
                 markdown; rag_list_collections reports what's configured; rag_index triggers \
                 a reindex."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::tool_list())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        Self::tool_list().into_iter().find(|t| t.name == name)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        let outcome = match request.name.as_ref() {
            "rag_search" => self.call_rag_search(&args).await,
            "rag_convert" => self.call_rag_convert(&args).await,
            "rag_list_collections" => Ok(self.call_rag_list_collections()),
            "rag_index" => self.call_rag_index(&args).await,
            other => {
                return Err(McpError::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    format!("no tool registered with name: {other}"),
                    None,
                ))
            }
        };

        match outcome {
            Ok(value) => {
                let text = serde_json::to_string_pretty(&value).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}
