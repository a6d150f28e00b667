//! SQL text helpers.
//!
//! The core consumes the SQL AST as an externally supplied capability —
//! clone, inspect, stringify — and otherwise works on query text. This
//! module centralizes parsing, canonicalization, and the content hashing
//! used to name generated state (materialized views, synthetic columns).

use std::hash::Hasher;
use std::ops::ControlFlow;

use fxhash::FxHasher;
use sqlparser::ast::{visit_expressions, Expr, Query, SelectItem, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::{Error, Result};

/// Aggregate function names the core recognizes when classifying select
/// items. Extends the pre-aggregation set with common aggregates so that
/// consolidation keying treats any aggregate query as grouped.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "mean",
    "min",
    "max",
    "median",
    "mode",
    "product",
    "first",
    "last",
    "arg_max",
    "arg_min",
    "argmax",
    "argmin",
    "max_by",
    "min_by",
    "string_agg",
    "array_agg",
    "list",
    "variance",
    "var_samp",
    "var_pop",
    "stddev",
    "stddev_samp",
    "stddev_pop",
    "covar_samp",
    "covar_pop",
    "corr",
    "entropy",
    "kurtosis",
    "skewness",
    "bit_and",
    "bit_or",
    "bit_xor",
    "bool_and",
    "bool_or",
    "quantile",
    "regr_count",
    "regr_avgx",
    "regr_avgy",
    "regr_sxx",
    "regr_syy",
    "regr_sxy",
    "regr_slope",
    "regr_intercept",
    "regr_r2",
];

/// Parses SQL text into statements.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the text is not valid SQL.
pub fn parse_statements(sql: &str) -> Result<Vec<Statement>> {
    Ok(Parser::parse_sql(&GenericDialect {}, sql)?)
}

/// Parses SQL text expected to contain exactly one query.
///
/// # Errors
///
/// Returns [`Error::Parse`] on invalid SQL, [`Error::ResultShape`] if the
/// text is not a single query statement.
pub fn parse_query(sql: &str) -> Result<Box<Query>> {
    let mut statements = parse_statements(sql)?;
    if statements.len() != 1 {
        return Err(Error::ResultShape(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(query),
        other => Err(Error::ResultShape(format!("not a query: {other}"))),
    }
}

/// Parses a standalone SQL expression.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the text is not a valid expression.
pub fn parse_expr(sql: &str) -> Result<Expr> {
    let mut parser = Parser::new(&GenericDialect {}).try_with_sql(sql)?;
    Ok(parser.parse_expr()?)
}

/// Canonical cache/consolidation key text for a request.
///
/// Keys carry the result shape so that the same SQL requested as columnar
/// and as JSON rows never alias one another in the cache.
#[must_use]
pub fn canonical_key(kind: crate::QueryKind, sql: &str) -> String {
    format!("{kind}:{}", sql.trim())
}

/// Deterministic content hash of SQL text, rendered as fixed-width hex.
///
/// Used to name generated state — materialized views, synthetic
/// consolidation columns, statistic columns — so repeated requests for the
/// same underlying text resolve to the same name with no shared counters.
#[must_use]
pub fn content_hash(text: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(text.as_bytes());
    format!("{:016x}", hasher.finish())
}

/// Short form of [`content_hash`] for column names.
#[must_use]
pub fn short_hash(text: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(text.as_bytes());
    format!("{:08x}", (hasher.finish() >> 32) as u32)
}

/// Returns true if the expression contains an aggregate function call.
///
/// Window functions (`OVER (...)`) are not aggregates for this purpose.
#[must_use]
pub fn contains_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    let _ = visit_expressions(expr, |e: &Expr| {
        if let Expr::Function(func) = e {
            if func.over.is_none() && is_aggregate_name(&func.name.to_string()) {
                found = true;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::<()>::Continue(())
    });
    found
}

/// Returns true if `name` is a recognized aggregate function name.
#[must_use]
pub fn is_aggregate_name(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    AGGREGATE_FUNCTIONS.contains(&lowered.as_str())
}

/// The output column name a select item produces.
///
/// Mirrors backend naming closely enough for demultiplexing: an explicit
/// alias wins, a plain (possibly qualified) column reference uses its last
/// identifier, anything else is named by its text.
#[must_use]
pub fn output_name(item: &SelectItem) -> Option<String> {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
        SelectItem::UnnamedExpr(expr) => Some(expr_output_name(expr)),
        _ => None,
    }
}

fn expr_output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map_or_else(|| expr.to_string(), |ident| ident.value.clone()),
        other => other.to_string(),
    }
}

fn is_plain_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quotes an identifier for use in generated SQL when it is not a plain
/// identifier already.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    if is_plain_ident(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// The expression of a select item, if it has one.
#[must_use]
pub fn item_expr(item: &SelectItem) -> Option<&Expr> {
    match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
        _ => None,
    }
}

/// Builds an aliased select item from expression text, quoting the alias
/// when it is not a plain identifier.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the expression text does not parse.
pub fn aliased_item(expr_sql: &str, alias: &str) -> Result<SelectItem> {
    let alias = if is_plain_ident(alias) {
        sqlparser::ast::Ident::new(alias)
    } else {
        sqlparser::ast::Ident::with_quote('"', alias)
    };
    Ok(SelectItem::ExprWithAlias {
        expr: parse_expr(expr_sql)?,
        alias,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_rejects_non_query() {
        assert!(parse_query("SELECT 1").is_ok());
        assert!(parse_query("DROP TABLE t").is_err());
        assert!(parse_query("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_content_hash_deterministic() {
        let a = content_hash("SELECT a FROM t");
        let b = content_hash("SELECT a FROM t");
        let c = content_hash("SELECT b FROM t");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert_eq!(short_hash("SELECT a FROM t").len(), 8);
    }

    #[test]
    fn test_canonical_key_separates_kinds() {
        let sql = "  SELECT 1 ";
        let columnar = canonical_key(crate::QueryKind::Columnar, sql);
        let json = canonical_key(crate::QueryKind::Json, sql);
        assert_ne!(columnar, json);
        assert!(columnar.ends_with("SELECT 1"));
    }

    #[test]
    fn test_contains_aggregate() {
        let agg = parse_expr("sum(x) / count(*)").unwrap();
        assert!(contains_aggregate(&agg));

        let plain = parse_expr("a + b * 2").unwrap();
        assert!(!contains_aggregate(&plain));

        // Window functions are not aggregates here.
        let window = parse_expr("sum(x) OVER (PARTITION BY g)").unwrap();
        assert!(!contains_aggregate(&window));
    }

    #[test]
    fn test_output_name() {
        let query = parse_query("SELECT a, t.b, sum(c) AS total, x + 1 FROM t").unwrap();
        let sqlparser::ast::SetExpr::Select(select) = query.body.as_ref() else {
            panic!("expected select");
        };
        let names: Vec<_> = select
            .projection
            .iter()
            .map(|item| output_name(item).unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "total", "x + 1"]);
    }
}
