//! # Kaleido Core
//!
//! The coordination core for interactive visualization clients sharing one
//! analytical database backend. Clients declare the data they need as SQL
//! queries; the core decides what to send, when, and whether a cheaper
//! equivalent query exists — it never executes SQL itself.
//!
//! This crate provides:
//! - **Scheduler**: priority dispatch, same-turn query consolidation, a
//!   client-side result cache, and issuance-order result delivery under
//!   out-of-order backend completion
//! - **Selections**: reactive multi-source filter state with pluggable
//!   resolution (intersect, union, single, crossfilter)
//! - **Pre-aggregation**: compatibility analysis of client queries,
//!   sufficient-statistics rewriting of aggregates, and pixel-binned
//!   materialized views for interval selections
//! - **Coordinator**: the top-level façade wiring clients, selections, and
//!   the scheduler together
//!
//! ## Example
//!
//! ```rust,ignore
//! use kaleido_core::{Coordinator, Selection};
//!
//! let coordinator = Coordinator::new(connector);
//! let brush = Selection::crossfilter();
//!
//! let id = coordinator.connect_client(chart).await?;
//! brush.update(clause);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod client;
pub mod connector;
pub mod consolidate;
pub mod coordinator;
pub mod mv;
pub mod queue;
pub mod rewrite;
pub mod scheduler;
pub mod selection;
pub mod sql;
pub mod testing;

pub use cache::CacheConfig;
pub use client::{Client, ClientId, FieldInfo, FieldRequest, Stat};
pub use connector::{Connector, ConnectorError, QueryKind, QueryRequest, QueryResponse};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use mv::{Plan, PreAggConfig, PreAggregator};
pub use queue::Priority;
pub use scheduler::{QueryRecorder, QueryResult, QueryScheduler, RequestId, SchedulerConfig};
pub use selection::{
    BinPolicy, Clause, ClauseMeta, ClauseValue, Resolver, Scalar, Scale, ScaleKind, Selection,
};

/// Result type for kaleido-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for kaleido-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend connector rejected a query.
    #[error("connector error: {0}")]
    Connector(#[from] connector::ConnectorError),

    /// A query could not be parsed as SQL.
    #[error("SQL parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    /// Result demultiplexing or reshaping failed.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// The request was cancelled before a result was delivered.
    #[error("query cancelled")]
    Cancelled,

    /// The scheduler has shut down and accepts no further requests.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// The client is already connected to this coordinator.
    #[error("client {0} is already connected")]
    ClientAlreadyConnected(ClientId),

    /// No client with the given id is connected.
    #[error("client {0} is not connected")]
    ClientNotFound(ClientId),

    /// A result did not have the shape the caller required.
    #[error("unexpected result shape: {0}")]
    ResultShape(String),

    /// Cache export/import failed.
    #[error("cache serialization error: {0}")]
    CacheSerde(String),
}
