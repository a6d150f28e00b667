//! Backend connector contract.
//!
//! The scheduler dispatches every query through a single [`Connector`],
//! an async adapter over whatever transport reaches the analytical backend
//! (in-process engine, socket, HTTP). The core assumes one logical backend
//! that accepts overlapping outstanding requests; it never assumes the
//! backend executes them concurrently.
//!
//! Transport implementations live outside this crate (see the
//! `kaleido-connectors` crate); the core only consumes this trait.

use std::fmt;

use arrow::array::RecordBatch;
use async_trait::async_trait;

/// How a query's result should be shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Statement executed for effect; no result rows.
    Exec,
    /// Column-oriented result table (Arrow).
    Columnar,
    /// Row-oriented result objects (JSON).
    Json,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Columnar => write!(f, "columnar"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// A single query to be scheduled against the backend.
///
/// Immutable once submitted. Priority is supplied separately at submission
/// time ([`crate::QueryScheduler::request`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Result shape.
    pub kind: QueryKind,
    /// Backend SQL text.
    pub sql: String,
    /// Whether the result may be served from / stored into the cache.
    pub cache: bool,
}

impl QueryRequest {
    /// Creates an effect-only request (DDL, maintenance). Not cached.
    #[must_use]
    pub fn exec(sql: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Exec,
            sql: sql.into(),
            cache: false,
        }
    }

    /// Creates a columnar result request. Cached by default.
    #[must_use]
    pub fn columnar(sql: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Columnar,
            sql: sql.into(),
            cache: true,
        }
    }

    /// Creates a row-object result request. Not cached by default.
    #[must_use]
    pub fn json(sql: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Json,
            sql: sql.into(),
            cache: false,
        }
    }

    /// Overrides the cache flag.
    #[must_use]
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }
}

/// A backend answer, shaped per [`QueryKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    /// An effect-only statement completed.
    Exec,
    /// A column-oriented result table.
    Table(RecordBatch),
    /// Row objects.
    Rows(Vec<serde_json::Value>),
}

impl QueryResponse {
    /// Returns the columnar table, if this is a [`QueryResponse::Table`].
    #[must_use]
    pub fn table(&self) -> Option<&RecordBatch> {
        match self {
            Self::Table(batch) => Some(batch),
            _ => None,
        }
    }

    /// Returns the JSON rows, if this is a [`QueryResponse::Rows`].
    #[must_use]
    pub fn rows(&self) -> Option<&[serde_json::Value]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Errors surfaced by connector implementations.
///
/// Variants are stringly-typed on purpose: the core treats the backend as
/// opaque, and a failed consolidated dispatch must fan one error out to
/// every constituent request, so the payload has to be cheaply clonable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    /// The backend reached but rejected the query.
    #[error("backend error: {0}")]
    Backend(String),

    /// The transport to the backend failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connector does not support the requested result shape.
    #[error("unsupported request: {0}")]
    Unsupported(String),
}

/// Async adapter over the backend database transport.
///
/// Implementations must accept overlapping outstanding requests; the
/// scheduler may keep several in flight at once.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Executes one request against the backend and returns its result.
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, ConnectorError>;
}
