//! # vs-search — The "Senses" of VESPER
//!
//! Everything that touches the search engine lives behind the
//! [`SearchBackend`] trait: opening point-in-time cursors, paging,
//! bounded counting, bulk write-back, and mapping migration. The scan
//! engine only depends on this trait, keeping it SDK-free; the two
//! implementations here are an Elasticsearch-compatible HTTP client
//! and an in-process backend used for fixtures and tests.

pub mod memory;
pub mod migrate;
pub mod sort;
pub mod stream;

#[cfg(feature = "http")]
pub mod http;

use serde_json::Value;

pub use sort::SortSpec;
pub use stream::{DocumentStream, BATCH_SIZE, PIT_KEEP_ALIVE};

/// Errors surfaced by a search backend.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("backend rejected the request: {0}")]
    Backend(String),

    #[error("point-in-time cursor expired or unknown: {0}")]
    CursorExpired(String),

    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

/// One hit from a page search.
#[derive(Debug, Clone)]
pub struct Hit {
    pub id: String,
    pub index: String,
    /// The document body. The engine can omit it under pressure; hits
    /// without a source are logged and skipped by the scanner.
    pub source: Option<Value>,
    /// Terminal sort key for this hit, fed back as `search_after`.
    pub sort: Value,
}

/// A page of hits. Empty means the cursor is exhausted.
#[derive(Debug, Default)]
pub struct SearchPage {
    pub hits: Vec<Hit>,
}

/// One operation in a bulk request.
#[derive(Debug, Clone)]
pub enum BulkOp {
    /// Partial-document update: `{ "doc": { ... } }` under an update
    /// header addressing `(_id, _index)`.
    Update { id: String, index: String, doc: Value },
}

/// Outcome of a bulk request.
#[derive(Debug, Clone, Copy)]
pub struct BulkSummary {
    /// True when at least one item failed.
    pub errors: bool,
    /// Number of items carried by the request.
    pub items: usize,
}

/// The backend operations the scanner consumes. Role labels, not API
/// names: any engine with point-in-time cursors, `search_after`
/// pagination, bounded counts, and bulk partial updates can sit behind
/// this.
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    /// Open a point-in-time cursor over `indices` with the given
    /// keep-alive, returning its id.
    async fn open_pit(&self, indices: &[String], keep_alive: &str) -> Result<String, SearchError>;

    /// Fetch one page of hits through a PIT. `search_after` is the
    /// previous page's terminal sort key; the first page omits it.
    async fn search_page(
        &self,
        pit_id: &str,
        query: &Value,
        sort: &Value,
        size: usize,
        search_after: Option<&Value>,
    ) -> Result<SearchPage, SearchError>;

    /// Release a point-in-time cursor. Best-effort; the engine reaps
    /// expired cursors on its own.
    async fn close_pit(&self, pit_id: &str) -> Result<(), SearchError>;

    /// Count documents matching `query`. With `terminate_after` the
    /// engine may stop early; the result is then at most the bound.
    async fn count(
        &self,
        indices: &[String],
        query: &Value,
        terminate_after: Option<u64>,
    ) -> Result<u64, SearchError>;

    /// Execute a bulk request.
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<BulkSummary, SearchError>;

    /// Idempotent mapping extension on one index.
    async fn put_mapping(&self, index: &str, properties: &Value) -> Result<(), SearchError>;
}
