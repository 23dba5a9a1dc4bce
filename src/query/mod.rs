//! Metadata query engine interface.
//!
//! # Data Flow
//! ```text
//! QueryRequest (fresh: text/key/select/params | resumed: cookie)
//!     → QueryEngine::query        → QueryPage (buffered hits + cookie)
//!     → QueryEngine::query_stream → QueryEvent::Hit * n, QueryEvent::End
//! ```
//!
//! # Design Decisions
//! - Cookies are opaque bytes owned by the engine; the protocol layer only
//!   hex-encodes them
//! - A cookie on the request side replaces text, key, select and params
//! - The streaming form is a `Stream` of events so hits reach the socket as
//!   soon as they are produced

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::ObjectId;

pub use memory::MemoryQueryEngine;

/// One query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    pub id: ObjectId,
    pub fields: BTreeMap<String, String>,
}

/// Parameters of a query call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub cache_id: String,
    /// Filter expression.
    pub text: Option<String>,
    /// Single-object lookup.
    pub key: Option<String>,
    /// Fields to return; empty means all.
    pub select: Vec<String>,
    /// Values bound to `:name` placeholders in `text`.
    pub params: BTreeMap<String, String>,
    /// Resume a previous scan.
    pub cookie: Option<Vec<u8>>,
    /// Cap on hits returned by this call; `None` is unbounded.
    pub max_results: Option<u32>,
}

/// A buffered page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPage {
    pub hits: Vec<Hit>,
    /// `None` when the scan is finished.
    pub cookie: Option<Vec<u8>>,
    /// Snapshot time all pages of one scan agree on.
    pub integrity_time: DateTime<Utc>,
}

/// Incremental output of a streaming query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    Hit(Hit),
    End {
        cookie: Option<Vec<u8>>,
        integrity_time: DateTime<Utc>,
    },
}

/// Query engine failures.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid cookie")]
    InvalidCookie,

    #[error("query engine failure: {0}")]
    Engine(String),
}

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// The metadata/query engine as seen by the protocol layer.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Run a query and collect the page.
    async fn query(&self, request: &QueryRequest) -> QueryResult<QueryPage>;

    /// Run a query yielding hits as they are found, then one `End` event.
    fn query_stream(&self, request: QueryRequest) -> BoxStream<'static, QueryResult<QueryEvent>>;
}
