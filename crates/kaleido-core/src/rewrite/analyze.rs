//! Compatibility analysis for pre-aggregation.
//!
//! Given a client's declared query, decide whether it can be served from a
//! materialized, pre-aggregated view instead of the raw table. The checks
//! run in order; the first failure makes the query ineligible (`None`),
//! which callers treat as "fall back to direct querying":
//!
//! 1. The query is a plain aggregate/group-by SELECT with a single,
//!    unambiguous base table reachable through subqueries and set
//!    operations.
//! 2. Every non-aggregate select item is also a GROUP BY key (a
//!    dimension); every aggregate select item decomposes through the
//!    sufficient-statistics rewriter. A `DISTINCT` qualifier anywhere
//!    disqualifies the query.

use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions_mut, Expr, GroupByExpr, Ident, OrderByKind, Query, SetExpr, TableFactor,
    Value,
};

use crate::rewrite::stats::{rewrite_aggregate, StatColumn};
use crate::sql::{contains_aggregate, is_aggregate_name, item_expr, output_name};

/// A grouping dimension of an analyzed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    /// Output column name.
    pub alias: String,
    /// Grouping expression text.
    pub sql: String,
}

/// An aggregate output of an analyzed query, rewritten over statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    /// Output column name.
    pub alias: String,
    /// Recombination expression over the view's statistic columns.
    pub sql: String,
}

/// The result of a successful compatibility analysis.
#[derive(Debug, Clone)]
pub struct AnalyzedQuery {
    /// The single base table.
    pub table: String,
    /// The client query (cloned); callers derive the view creation query
    /// from it by replacing projection and grouping.
    pub base: Box<Query>,
    /// Grouping dimensions, in select order.
    pub dimensions: Vec<Dimension>,
    /// Partition statistic columns the view must carry (deduplicated).
    pub stats: Vec<StatColumn>,
    /// Aggregate outputs rewritten in terms of the statistics.
    pub outputs: Vec<OutputColumn>,
    /// Rendered ORDER BY list of the original query, if any.
    pub order_by: Option<String>,
}

/// Analyzes a client query for pre-aggregation eligibility.
#[must_use]
pub fn analyze(query: &Query) -> Option<AnalyzedQuery> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    if select.distinct.is_some() || select.having.is_some() || select.qualify.is_some() {
        return None;
    }
    if query.limit_clause.is_some() || query.fetch.is_some() {
        return None;
    }

    let table = base_table(query)?;
    let group_exprs = match &select.group_by {
        GroupByExpr::Expressions(exprs, modifiers) if modifiers.is_empty() => exprs,
        _ => return None,
    };

    let mut dimensions = Vec::new();
    let mut outputs = Vec::new();
    let mut stats: Vec<StatColumn> = Vec::new();

    for (position, item) in select.projection.iter().enumerate() {
        let expr = item_expr(item)?;
        let alias = output_name(item)?;
        if contains_aggregate(expr) {
            let rewritten = rewrite_outputs(expr, &table, &mut stats)?;
            outputs.push(OutputColumn {
                alias,
                sql: rewritten,
            });
        } else {
            if !is_grouped(expr, &alias, position, group_exprs) {
                return None;
            }
            dimensions.push(Dimension {
                alias,
                sql: expr.to_string(),
            });
        }
    }
    if outputs.is_empty() {
        return None;
    }

    // Every GROUP BY key must surface as a dimension, or the view could
    // not reproduce the grouping.
    for group in group_exprs {
        if !group_matches_dimension(group, select.projection.len(), &dimensions) {
            return None;
        }
    }

    let order_by = match &query.order_by {
        None => None,
        Some(order_by) => match &order_by.kind {
            OrderByKind::Expressions(exprs) => Some(
                exprs
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            OrderByKind::All(_) => return None,
        },
    };

    Some(AnalyzedQuery {
        table,
        base: Box::new(query.clone()),
        dimensions,
        stats,
        outputs,
        order_by,
    })
}

/// Rewrites every aggregate call inside `expr` through the
/// sufficient-statistics rewriter, collecting the statistics, and returns
/// the recombination expression text.
///
/// Aggregates are first swapped for placeholder identifiers so the
/// rewriter never descends into its own output, then the placeholders are
/// substituted in the rendered text.
fn rewrite_outputs(expr: &Expr, table: &str, stats: &mut Vec<StatColumn>) -> Option<String> {
    let mut rewritten = expr.clone();
    let mut replacements: Vec<String> = Vec::new();
    let mut failed = false;

    let _ = visit_expressions_mut(&mut rewritten, |node: &mut Expr| {
        if let Expr::Function(func) = node {
            if func.over.is_none() && is_aggregate_name(&func.name.to_string()) {
                let Some(rewrite) = rewrite_aggregate(func, table) else {
                    failed = true;
                    return ControlFlow::Break(());
                };
                for stat in rewrite.stats {
                    if !stats.iter().any(|s| s.name == stat.name) {
                        stats.push(stat);
                    }
                }
                let placeholder = format!("__kaleido_agg_{}__", replacements.len());
                replacements.push(format!("({})", rewrite.output_sql));
                *node = Expr::Identifier(Ident::new(placeholder));
            }
        }
        ControlFlow::<()>::Continue(())
    });
    if failed {
        return None;
    }

    let mut text = rewritten.to_string();
    for (index, replacement) in replacements.iter().enumerate() {
        text = text.replace(&format!("__kaleido_agg_{index}__"), replacement);
    }
    Some(text)
}

/// True if a non-aggregate select item is covered by the GROUP BY list,
/// by expression text, by alias reference, or by ordinal position.
fn is_grouped(expr: &Expr, alias: &str, position: usize, group_exprs: &[Expr]) -> bool {
    let text = expr.to_string();
    group_exprs.iter().any(|group| match group {
        Expr::Identifier(ident) if ident.value == alias => true,
        Expr::Value(value) => ordinal(value) == Some(position + 1),
        other => other.to_string() == text,
    })
}

fn group_matches_dimension(
    group: &Expr,
    projection_len: usize,
    dimensions: &[Dimension],
) -> bool {
    match group {
        Expr::Identifier(ident) if dimensions.iter().any(|d| d.alias == ident.value) => true,
        Expr::Value(value) => {
            ordinal(value).is_some_and(|ordinal| ordinal >= 1 && ordinal <= projection_len)
        }
        other => {
            let text = other.to_string();
            dimensions.iter().any(|d| d.sql == text)
        }
    }
}

fn ordinal(value: &sqlparser::ast::ValueWithSpan) -> Option<usize> {
    match &value.value {
        Value::Number(number, _) => number.parse().ok(),
        _ => None,
    }
}

/// Finds the single base table reachable by following subqueries and set
/// operations. `None` if no table or more than one distinct table is
/// found, or if the FROM shape is anything but a single plain relation.
fn base_table(query: &Query) -> Option<String> {
    let mut tables: Vec<String> = Vec::new();
    if !collect_tables(query, &mut tables) {
        return None;
    }
    tables.dedup();
    match tables.as_slice() {
        [table] => Some(table.clone()),
        _ => None,
    }
}

fn collect_tables(query: &Query, tables: &mut Vec<String>) -> bool {
    collect_from_body(query.body.as_ref(), tables)
}

fn collect_from_body(body: &SetExpr, tables: &mut Vec<String>) -> bool {
    match body {
        SetExpr::Select(select) => {
            if select.from.len() != 1 || !select.from[0].joins.is_empty() {
                return false;
            }
            match &select.from[0].relation {
                TableFactor::Table { name, .. } => {
                    let name = name.to_string();
                    if !tables.contains(&name) {
                        tables.push(name);
                    }
                    true
                }
                TableFactor::Derived { subquery, .. } => collect_tables(subquery, tables),
                _ => false,
            }
        }
        SetExpr::Query(query) => collect_tables(query, tables),
        SetExpr::SetOperation { left, right, .. } => {
            collect_from_body(left, tables) && collect_from_body(right, tables)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse_query;

    fn analyzed(sql: &str) -> Option<AnalyzedQuery> {
        analyze(&parse_query(sql).unwrap())
    }

    // -- eligibility --

    #[test]
    fn test_plain_group_by_aggregate_is_eligible() {
        let analysis =
            analyzed("SELECT g, count(*) AS n, avg(x) AS mean FROM pts GROUP BY g").unwrap();
        assert_eq!(analysis.table, "pts");
        assert_eq!(analysis.dimensions.len(), 1);
        assert_eq!(analysis.dimensions[0].alias, "g");
        assert_eq!(analysis.outputs.len(), 2);
        // count(*) + avg(x) share no stats: n, a, count(x).
        assert_eq!(analysis.stats.len(), 3);
        assert!(analysis.order_by.is_none());
    }

    #[test]
    fn test_base_table_found_through_subquery_and_union() {
        let analysis = analyzed(
            "SELECT count(*) AS n FROM \
             (SELECT x FROM pts WHERE x > 0 UNION ALL SELECT x FROM pts)",
        )
        .unwrap();
        assert_eq!(analysis.table, "pts");
    }

    #[test]
    fn test_ambiguous_base_table_is_ineligible() {
        assert!(analyzed(
            "SELECT count(*) AS n FROM \
             (SELECT x FROM pts UNION ALL SELECT x FROM other)"
        )
        .is_none());
        assert!(analyzed("SELECT count(*) AS n FROM a, b").is_none());
        assert!(analyzed("SELECT count(*) AS n FROM a JOIN b ON a.id = b.id").is_none());
    }

    #[test]
    fn test_ungrouped_non_aggregate_is_ineligible() {
        assert!(analyzed("SELECT g, count(*) AS n FROM pts").is_none());
    }

    #[test]
    fn test_group_by_alias_and_ordinal() {
        assert!(analyzed("SELECT x + 1 AS bucket, count(*) AS n FROM pts GROUP BY bucket").is_some());
        assert!(analyzed("SELECT x + 1 AS bucket, count(*) AS n FROM pts GROUP BY 1").is_some());
    }

    #[test]
    fn test_unsupported_aggregate_is_ineligible() {
        assert!(analyzed("SELECT g, median(x) AS m FROM pts GROUP BY g").is_none());
        assert!(analyzed("SELECT g, count(DISTINCT x) AS n FROM pts GROUP BY g").is_none());
    }

    #[test]
    fn test_shape_restrictions() {
        assert!(analyzed("SELECT DISTINCT g, count(*) AS n FROM pts GROUP BY g").is_none());
        assert!(analyzed("SELECT g, count(*) AS n FROM pts GROUP BY g HAVING count(*) > 1").is_none());
        assert!(analyzed("SELECT g, count(*) AS n FROM pts GROUP BY g LIMIT 5").is_none());
        assert!(analyzed("SELECT g FROM pts GROUP BY g").is_none());
    }

    // -- rewriting --

    #[test]
    fn test_aggregate_expression_rewrites_in_place() {
        let analysis =
            analyzed("SELECT g, sum(x) / count(*) AS rate FROM pts GROUP BY g").unwrap();
        let rate = &analysis.outputs[0];
        assert_eq!(rate.alias, "rate");
        // Both nested aggregates were replaced by recombinations over
        // statistic columns.
        assert!(rate.sql.contains("(sum("));
        assert!(rate.sql.contains("coalesce"));
        assert!(!rate.sql.contains("count(*)"));
        assert_eq!(analysis.stats.len(), 2);
    }

    #[test]
    fn test_where_clause_is_preserved_in_base() {
        let analysis =
            analyzed("SELECT g, count(*) AS n FROM pts WHERE x > 0 GROUP BY g").unwrap();
        assert!(analysis.base.to_string().contains("WHERE x > 0"));
    }

    #[test]
    fn test_order_by_is_captured() {
        let analysis =
            analyzed("SELECT g, count(*) AS n FROM pts GROUP BY g ORDER BY g DESC").unwrap();
        assert_eq!(analysis.order_by.as_deref(), Some("g DESC"));
    }
}
