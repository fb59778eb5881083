//! # Context Harness
//!
//! A local-first retrieval-augmented search engine: index files, git
//! repositories, Obsidian vaults, calibre libraries, mailboxes, and RSS
//! feeds into a per-user SQLite store, then query them through a hybrid
//! dense+lexical search engine over stdio (MCP) or HTTP.
//!
//! ## Architecture
//!
//! ```text
//! indexers (project/git/vault/calibre/email/rss)
//!        │  SourceItem
//!        ▼
//! chunk + embed (best-effort) ──▶ per-user SQLite store (FTS5 + vectors)
//!        │                              │
//!        ▼                              ▼
//! single-writer queue            hybrid_search (RRF)
//!        ▲                              │
//!        │                              ▼
//! watcher / system_watcher        mcp.rs (stdio) / server.rs (HTTP)
//! ```
//!
//! Binary containers (PDF/EPUB) are converted to text through a
//! content-addressed cache ([`convert_cache`]) shared across every
//! per-user store on the host, so the same file is never converted twice.
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration parsing and validation
//! - [`models`] — Core data types: `Collection`, `Source`, `DocumentChunk`, `SearchResult`
//! - [`db`] — SQLite connection management (per-user store + shared conversion cache)
//! - [`migrate`] — Schema migrations, FTS5 virtual table + sync triggers
//! - [`convert_cache`] — Content-addressed PDF/EPUB-to-text conversion cache
//! - [`chunk`] — Paragraph-boundary text chunker with heading breadcrumbs
//! - [`embedding`] — Embedding provider trait: OpenAI, Ollama, local (fastembed/tract)
//! - [`indexers`] — Source-specific indexers and the shared sync/chunk/embed/store skeleton
//! - [`queue`] — Single-writer indexing queue
//! - [`watcher`] — Debounced filesystem watcher
//! - [`system_watcher`] — Debounced watcher for email/RSS/calibre system sources
//! - [`leader`] — Cross-process leader lock and startup sync
//! - [`search`] — Hybrid dense+lexical search engine (reciprocal rank fusion)
//! - [`get`] — Source retrieval by collection + path
//! - [`sources`] — Collection configuration and health listing
//! - [`auth`] — Bearer-token authentication for the HTTP transport
//! - [`path_mapping`] — Per-user host-path ↔ caller-visible-path translation
//! - [`mcp`] — MCP tool endpoint (stdio)
//! - [`server`] — Authenticated HTTP tool endpoint
//! - [`logging`] — `tracing` subscriber setup
//! - [`error`] — Typed error taxonomy
//!
//! ## Quick Start
//!
//! ```bash
//! ctx init                      # create the per-user store
//! ctx sources                   # list configured collections and health
//! ctx sync home                 # index a collection once
//! ctx search "deployment"       # hybrid search
//! ctx get home a.md             # reassemble a source's chunks
//! ctx serve mcp                 # stdio MCP tool endpoint
//! ctx serve http                # authenticated HTTP tool endpoint
//! ctx watch                     # run the watcher + leader + startup sync
//! ```

pub mod auth;
pub mod chunk;
pub mod config;
pub mod convert_cache;
pub mod db;
pub mod embedding;
pub mod error;
pub mod get;
pub mod indexers;
pub mod leader;
pub mod logging;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod path_mapping;
pub mod queue;
pub mod search;
pub mod server;
pub mod sources;
pub mod system_watcher;
pub mod watcher;
