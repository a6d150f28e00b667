//! Filter clauses.
//!
//! A clause is one filter predicate contribution to a [`super::Selection`],
//! tagged with its originating source and shape metadata. Clauses are
//! created by interaction code and consumed read-only by the core; the
//! metadata drives materialized-view specialization (point columns,
//! interval scales and binning hints).

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashSet;
use sqlparser::ast::Expr;

use crate::client::ClientId;

/// Hook invoked when a `single`-resolver selection displaces this clause's
/// source.
pub type ResetHook = Arc<dyn Fn() + Send + Sync>;

/// A scalar domain value carried by a clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Text value.
    Text(String),
    /// Boolean value.
    Bool(bool),
    /// SQL NULL.
    Null,
}

impl Scalar {
    /// Renders the value as a SQL literal.
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Self::Bool(v) => v.to_string().to_uppercase(),
            Self::Null => "NULL".to_string(),
        }
    }
}

/// The domain value a clause selects.
#[derive(Debug, Clone, PartialEq)]
pub enum ClauseValue {
    /// A single point value.
    Scalar(Scalar),
    /// A list of point values (one per column for multi-column points, or
    /// a membership list for a single column).
    List(Vec<Scalar>),
    /// One `[lo, hi]` interval per scale.
    Intervals(Vec<(f64, f64)>),
}

/// Continuous scale transform kinds supported for interval binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    /// Identity mapping (already in screen units).
    Identity,
    /// Linear domain→range mapping.
    Linear,
    /// Logarithmic (default base e; see [`Scale::base`]).
    Log,
    /// Power with exponent [`Scale::exponent`].
    Pow,
    /// Square root.
    Sqrt,
    /// Symmetric log with constant [`Scale::constant`].
    Symlog,
    /// Time in epoch milliseconds.
    Time,
}

/// Rounding policy applied when quantizing to bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinPolicy {
    /// Truncate toward negative infinity.
    #[default]
    Floor,
    /// Round up.
    Ceil,
    /// Round to nearest.
    Round,
}

/// One interval dimension's domain→range mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Scale {
    /// The source column the scale maps.
    pub column: String,
    /// Transform kind.
    pub kind: ScaleKind,
    /// Data domain `[lo, hi]`.
    pub domain: (f64, f64),
    /// Screen range `[lo, hi]` in pixels.
    pub range: (f64, f64),
    /// Log base (log scales only; `None` = natural log).
    pub base: Option<f64>,
    /// Exponent (pow scales only).
    pub exponent: Option<f64>,
    /// Symlog constant (symlog scales only).
    pub constant: Option<f64>,
}

impl Scale {
    /// Creates a linear scale over the given column.
    #[must_use]
    pub fn linear(column: impl Into<String>, domain: (f64, f64), range: (f64, f64)) -> Self {
        Self {
            column: column.into(),
            kind: ScaleKind::Linear,
            domain,
            range,
            base: None,
            exponent: None,
            constant: None,
        }
    }

    /// Creates a scale of the given kind over the column.
    #[must_use]
    pub fn new(
        column: impl Into<String>,
        kind: ScaleKind,
        domain: (f64, f64),
        range: (f64, f64),
    ) -> Self {
        Self {
            column: column.into(),
            kind,
            domain,
            range,
            base: None,
            exponent: None,
            constant: None,
        }
    }

    /// Sets the log base.
    #[must_use]
    pub fn with_base(mut self, base: f64) -> Self {
        self.base = Some(base);
        self
    }

    /// Sets the pow exponent.
    #[must_use]
    pub fn with_exponent(mut self, exponent: f64) -> Self {
        self.exponent = Some(exponent);
        self
    }

    /// Sets the symlog constant.
    #[must_use]
    pub fn with_constant(mut self, constant: f64) -> Self {
        self.constant = Some(constant);
        self
    }
}

/// Shape metadata describing how a clause selects.
#[derive(Debug, Clone, PartialEq)]
pub enum ClauseMeta {
    /// Discrete point selection over the given columns.
    Point {
        /// Predicate columns, one dimension each, unbinned.
        columns: Vec<String>,
    },
    /// Continuous interval selection, binned to interactive pixels.
    Interval {
        /// One scale per brushed dimension.
        scales: Vec<Scale>,
        /// Bin width in pixels.
        pixel_size: f64,
        /// Rounding policy for bin quantization.
        policy: BinPolicy,
    },
    /// Text match selection. Not eligible for view acceleration.
    Match {
        /// The matched column.
        column: String,
        /// Match method hint (e.g. `contains`, `regexp`).
        method: Option<String>,
    },
}

/// One filter predicate contribution to a selection.
#[derive(Clone)]
pub struct Clause {
    /// Originating source identity. Updating a clause from a given source
    /// replaces only that source's prior clause.
    pub source: String,
    /// Clients excluded from self-filtering under crossfilter.
    pub clients: FxHashSet<ClientId>,
    /// The selected domain value, if any.
    pub value: Option<ClauseValue>,
    /// The filter predicate, `None` for an empty (cleared) selection.
    pub predicate: Option<Expr>,
    /// Shape metadata for acceleration.
    pub meta: Option<ClauseMeta>,
    /// Displacement hook for the `single` resolver.
    pub reset: Option<ResetHook>,
}

impl Clause {
    /// Creates an empty clause for the given source.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            clients: FxHashSet::default(),
            value: None,
            predicate: None,
            meta: None,
            reset: None,
        }
    }

    /// Adds a client to the self-filtering exclusion set.
    #[must_use]
    pub fn with_client(mut self, client: ClientId) -> Self {
        self.clients.insert(client);
        self
    }

    /// Sets the domain value.
    #[must_use]
    pub fn with_value(mut self, value: ClauseValue) -> Self {
        self.value = Some(value);
        self
    }

    /// Sets the predicate expression.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Expr) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Sets the shape metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: ClauseMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Sets the displacement hook.
    #[must_use]
    pub fn with_reset(mut self, reset: ResetHook) -> Self {
        self.reset = Some(reset);
        self
    }
}

impl fmt::Debug for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clause")
            .field("source", &self.source)
            .field("clients", &self.clients)
            .field("value", &self.value)
            .field("predicate", &self.predicate.as_ref().map(ToString::to_string))
            .field("meta", &self.meta)
            .field("reset", &self.reset.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sql_literals() {
        assert_eq!(Scalar::Int(42).to_sql(), "42");
        assert_eq!(Scalar::Float(1.5).to_sql(), "1.5");
        assert_eq!(Scalar::Text("o'brien".into()).to_sql(), "'o''brien'");
        assert_eq!(Scalar::Bool(true).to_sql(), "TRUE");
        assert_eq!(Scalar::Null.to_sql(), "NULL");
    }

    #[test]
    fn test_clause_builder() {
        let clause = Clause::new("brush-x")
            .with_client(ClientId::from_raw(1))
            .with_value(ClauseValue::Intervals(vec![(0.0, 10.0)]))
            .with_meta(ClauseMeta::Interval {
                scales: vec![Scale::linear("x", (0.0, 100.0), (0.0, 500.0))],
                pixel_size: 1.0,
                policy: BinPolicy::Floor,
            });
        assert_eq!(clause.source, "brush-x");
        assert!(clause.clients.contains(&ClientId::from_raw(1)));
        assert!(clause.predicate.is_none());
        // Debug must not panic on the reset hook.
        let _ = format!("{clause:?}");
    }
}
