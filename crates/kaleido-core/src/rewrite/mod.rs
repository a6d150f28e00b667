//! Query rewriting for pre-aggregation.
//!
//! - [`stats`]: decomposes non-additive aggregates into partition-additive
//!   sufficient statistics plus a closed-form recombination expression.
//! - [`analyze`]: static compatibility analysis deciding whether a client
//!   query can be served from a materialized, pre-aggregated view.

pub mod analyze;
pub mod stats;

pub use analyze::{analyze, AnalyzedQuery, Dimension, OutputColumn};
pub use stats::{rewrite_aggregate, AggregateRewrite, StatColumn};
