//! Client contract.
//!
//! A client is an externally owned view onto some slice of the data — in an
//! embedding application typically one chart. The core holds a non-owning
//! handle plus per-client scheduling and acceleration state; creation and
//! destruction belong to the embedding application, which registers clients
//! with the [`crate::Coordinator`].

use std::fmt;

use sqlparser::ast::{Expr, Query};

use crate::connector::QueryResponse;
use crate::selection::Selection;
use crate::Error;

/// Identity assigned to a client when it connects to a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl ClientId {
    /// Constructs an id from a raw value (test and interop use).
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// A column statistic a client can request at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
    /// Total row count.
    Count,
    /// Distinct value count.
    Distinct,
    /// Null count.
    Nulls,
}

impl Stat {
    /// Renders the aggregate expression computing this statistic.
    #[must_use]
    pub fn expression(self, column: &str) -> String {
        match self {
            Self::Min => format!("min({column})"),
            Self::Max => format!("max({column})"),
            Self::Count => "count(*)".to_string(),
            Self::Distinct => format!("count(DISTINCT {column})"),
            Self::Nulls => format!("count(*) FILTER (WHERE {column} IS NULL)"),
        }
    }

    /// The column name the statistic is delivered under. `DISTINCT` is a
    /// reserved word on most backends, so that statistic gets a longer
    /// name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Distinct => "distinct_count",
            Self::Nulls => "nulls",
        }
    }
}

/// A client's request for column metadata, issued once at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRequest {
    /// Table the column lives in.
    pub table: String,
    /// Column name.
    pub column: String,
    /// Statistics to compute.
    pub stats: Vec<Stat>,
}

impl FieldRequest {
    /// Creates a field request.
    #[must_use]
    pub fn new(table: impl Into<String>, column: impl Into<String>, stats: Vec<Stat>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            stats,
        }
    }
}

/// Column metadata delivered back to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    /// Table the column lives in.
    pub table: String,
    /// Column name.
    pub column: String,
    /// Computed statistics, keyed by [`Stat::name`].
    pub stats: serde_json::Map<String, serde_json::Value>,
}

/// The client contract.
///
/// All callbacks run on the coordinator's update path and should return
/// promptly; heavy work belongs in the embedding application's own tasks.
pub trait Client: Send + Sync {
    /// Column metadata needed before the first data query. Default: none.
    fn fields(&self) -> Vec<FieldRequest> {
        Vec::new()
    }

    /// Receives the metadata requested through [`Client::fields`].
    fn field_info(&self, _info: &[FieldInfo]) {}

    /// Produces the client's query for the given filter predicates.
    ///
    /// `filter` is a conjunction list resolved from the client's bound
    /// [`Selection`] (empty = unfiltered). Returning `None` means the
    /// client has nothing to ask right now.
    fn query(&self, filter: &[Expr]) -> Option<Query>;

    /// Signals that a query on the client's behalf has been submitted.
    fn query_pending(&self) {}

    /// Delivers a query result.
    fn query_result(&self, data: &QueryResponse);

    /// Delivers a query failure.
    fn query_error(&self, error: &Error);

    /// The selection this client filters by, if any.
    fn filter_by(&self) -> Option<Selection> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_expressions() {
        assert_eq!(Stat::Min.expression("price"), "min(price)");
        assert_eq!(Stat::Count.expression("price"), "count(*)");
        assert_eq!(
            Stat::Nulls.expression("price"),
            "count(*) FILTER (WHERE price IS NULL)"
        );
        assert_eq!(Stat::Distinct.expression("price"), "count(DISTINCT price)");
    }

    #[test]
    fn test_client_id_display() {
        assert_eq!(ClientId::from_raw(7).to_string(), "client#7");
    }
}
