//! Same-turn query consolidation.
//!
//! Two queries are consolidation-compatible iff, after stripping their
//! select lists and resolving select-alias references in GROUP BY / ORDER
//! BY back to the underlying expressions, the remaining query shape is
//! textually identical. Compatible queries issued in one scheduling turn
//! are merged into a single physical query whose select list is the union
//! of all distinct requested expressions; the combined result is then
//! demultiplexed back per constituent.
//!
//! Queries whose WHERE / HAVING / QUALIFY reference derived (aliased)
//! columns are never consolidated — those references cannot be resolved
//! without changing meaning. Ungrouped aggregate queries carry an explicit
//! marker in their key so they never merge with plain row queries over the
//! same table.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, Schema};
use fxhash::{FxHashMap, FxHashSet};
use sqlparser::ast::{
    Expr, GroupByExpr, OrderByKind, Query, Select, SelectItem, SetExpr, Statement,
};

use crate::sql;
use crate::{Error, Result};

/// A buffered request that has been analyzed for consolidation.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Compatibility key: normalized shape text plus aggregate marker.
    pub key: String,
    /// Normalized query (select list stripped, aliases resolved); the
    /// merge base for its compatibility group.
    base: Box<Query>,
    /// The requested select columns, in order.
    items: Vec<RequestedColumn>,
}

/// One select-list column a constituent request asked for.
#[derive(Debug, Clone)]
struct RequestedColumn {
    /// Expression text (canonical, re-rendered from the AST).
    expr_sql: String,
    /// Output column name the caller will observe.
    output: String,
}

/// Instructions to project a combined result back to one constituent.
#[derive(Debug, Clone)]
pub struct DemuxPlan {
    /// `(synthetic column in the combined result, output column name)`.
    columns: Vec<(String, String)>,
}

/// The synthetic column name a requested expression gets in a combined
/// query. Content-addressed so identical expressions from different
/// constituents collapse to one physical column.
#[must_use]
pub fn synthetic_name(expr_sql: &str) -> String {
    format!("c{}", sql::short_hash(expr_sql))
}

/// Analyzes request SQL for consolidation eligibility.
///
/// Returns `None` for anything that must be dispatched as-is: text that is
/// not a single plain SELECT, select lists containing wildcards, or
/// derived-column references in WHERE / HAVING / QUALIFY.
#[must_use]
pub fn candidate(request_sql: &str) -> Option<Candidate> {
    let mut statements = sql::parse_statements(request_sql).ok()?;
    if statements.len() != 1 {
        return None;
    }
    let Statement::Query(mut query) = statements.remove(0) else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_mut() else {
        return None;
    };

    let mut aliases: FxHashMap<String, Expr> = FxHashMap::default();
    let mut items = Vec::with_capacity(select.projection.len());
    let mut has_aggregate = false;
    for item in &select.projection {
        let expr = sql::item_expr(item)?;
        let output = sql::output_name(item)?;
        if let SelectItem::ExprWithAlias { expr, alias } = item {
            aliases.insert(alias.value.clone(), expr.clone());
        }
        has_aggregate |= sql::contains_aggregate(expr);
        items.push(RequestedColumn {
            expr_sql: expr.to_string(),
            output,
        });
    }

    if references_alias(select, &aliases) {
        return None;
    }

    resolve_aliases(select, &aliases);
    if let Some(order_by) = &mut query.order_by {
        if let OrderByKind::Expressions(exprs) = &mut order_by.kind {
            for entry in exprs.iter_mut() {
                resolve_alias_expr(&mut entry.expr, &aliases);
            }
        }
    }

    let ungrouped = matches!(&select.group_by, GroupByExpr::Expressions(exprs, _) if exprs.is_empty());
    select.projection = vec![SelectItem::UnnamedExpr(Expr::Identifier(
        sqlparser::ast::Ident::new("*"),
    ))];

    let marker = if ungrouped && has_aggregate {
        "#aggregate"
    } else {
        ""
    };
    let key = format!("{query}{marker}");

    Some(Candidate { key, base: query, items })
}

/// True if WHERE / HAVING / QUALIFY reference a select alias.
fn references_alias(select: &Select, aliases: &FxHashMap<String, Expr>) -> bool {
    if aliases.is_empty() {
        return false;
    }
    let names: FxHashSet<&str> = aliases.keys().map(String::as_str).collect();
    [&select.selection, &select.having, &select.qualify]
        .into_iter()
        .flatten()
        .any(|expr| expr_references(expr, &names))
}

fn expr_references(expr: &Expr, names: &FxHashSet<&str>) -> bool {
    use std::ops::ControlFlow;
    let mut found = false;
    let _ = sqlparser::ast::visit_expressions(expr, |e: &Expr| {
        if let Expr::Identifier(ident) = e {
            if names.contains(ident.value.as_str()) {
                found = true;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::<()>::Continue(())
    });
    found
}

/// Rewrites GROUP BY references that point at select aliases back to the
/// underlying expressions.
fn resolve_aliases(select: &mut Select, aliases: &FxHashMap<String, Expr>) {
    if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
        for expr in exprs.iter_mut() {
            resolve_alias_expr(expr, aliases);
        }
    }
}

fn resolve_alias_expr(expr: &mut Expr, aliases: &FxHashMap<String, Expr>) {
    if let Expr::Identifier(ident) = expr {
        if let Some(resolved) = aliases.get(&ident.value) {
            *expr = resolved.clone();
        }
    }
}

/// Builds the combined physical query for one compatibility group.
///
/// The select list is the deduplicated union of every constituent's
/// requested expressions, each under its [`synthetic_name`]. Returns the
/// physical SQL plus one [`DemuxPlan`] per constituent, in input order.
///
/// # Errors
///
/// Returns [`Error::Parse`] if a requested expression fails to re-parse
/// (which would indicate a bug in [`candidate`]).
pub fn merge(group: &[&Candidate]) -> Result<(String, Vec<DemuxPlan>)> {
    debug_assert!(!group.is_empty());

    let mut synthetic: FxHashMap<&str, String> = FxHashMap::default();
    let mut union: Vec<SelectItem> = Vec::new();
    for cand in group {
        for col in &cand.items {
            if !synthetic.contains_key(col.expr_sql.as_str()) {
                let name = synthetic_name(&col.expr_sql);
                union.push(sql::aliased_item(&col.expr_sql, &name)?);
                synthetic.insert(&col.expr_sql, name);
            }
        }
    }

    let mut combined = group[0].base.clone();
    if let SetExpr::Select(select) = combined.body.as_mut() {
        select.projection = union;
    }

    let plans = group
        .iter()
        .map(|cand| DemuxPlan {
            columns: cand
                .items
                .iter()
                .map(|col| (synthetic[col.expr_sql.as_str()].clone(), col.output.clone()))
                .collect(),
        })
        .collect();

    Ok((combined.to_string(), plans))
}

/// Projects a combined result batch back to one constituent's columns.
///
/// # Errors
///
/// Returns [`Error::ResultShape`] if an expected synthetic column is
/// missing from the combined result.
pub fn demux(batch: &RecordBatch, plan: &DemuxPlan) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(plan.columns.len());
    let mut columns = Vec::with_capacity(plan.columns.len());
    for (synthetic, output) in &plan.columns {
        let index = schema.index_of(synthetic).map_err(|_| {
            Error::ResultShape(format!("combined result is missing column {synthetic}"))
        })?;
        let source = schema.field(index);
        fields.push(Field::new(
            output,
            source.data_type().clone(),
            source.is_nullable(),
        ));
        columns.push(Arc::clone(batch.column(index)));
    }
    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        columns,
    )?)
}
