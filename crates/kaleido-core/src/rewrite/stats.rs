//! Sufficient-statistics decomposition of aggregates.
//!
//! The average of per-partition averages is not the overall average; the
//! same holds for variance, covariance, correlation, and the regression
//! family. Each supported aggregate is decomposed here into statistics
//! that *are* additive across partitions, so a pre-partitioned
//! materialized view can answer any sub-selection by summing the relevant
//! partitions and applying a recombination formula.
//!
//! Centered statistics (variance and the covariance family) subtract the
//! *global* mean of the column — computed once via a scalar subquery over
//! the base table — before squaring, which keeps the summed squares small
//! and the floating-point error bounded.
//!
//! Statistic columns are named by content hash of their defining
//! expression, so repeated requests for the same underlying expression
//! reuse one view column instead of duplicating it.

use sqlparser::ast::{
    DuplicateTreatment, Function, FunctionArg, FunctionArgExpr, FunctionArguments,
};

use crate::sql::short_hash;

/// One partition-level statistic column of a materialized view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatColumn {
    /// Content-addressed column name.
    pub name: String,
    /// Defining aggregate expression, including any FILTER clause.
    pub sql: String,
}

/// The decomposition of one aggregate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRewrite {
    /// Recombination expression over the statistic column names.
    pub output_sql: String,
    /// Statistics the view must carry for this aggregate.
    pub stats: Vec<StatColumn>,
}

/// Decomposes an aggregate function call into partition statistics plus a
/// recombination expression.
///
/// Returns `None` for unsupported aggregates, `DISTINCT`-qualified
/// aggregates, and window function calls — the caller treats that as
/// "query not eligible for acceleration".
///
/// `table` is the single base table of the query, used for the global-mean
/// scalar subqueries of the centered statistics.
#[must_use]
pub fn rewrite_aggregate(func: &Function, table: &str) -> Option<AggregateRewrite> {
    if func.over.is_some() || !func.within_group.is_empty() {
        return None;
    }
    let name = func.name.to_string().to_ascii_lowercase();
    let args = argument_texts(func)?;
    let filter = func.filter.as_ref().map(ToString::to_string);
    Rewriter {
        table,
        filter,
        stats: Vec::new(),
    }
    .rewrite(&name, &args)
}

/// Extracts argument texts; `None` for DISTINCT or subquery arguments.
fn argument_texts(func: &Function) -> Option<Vec<String>> {
    match &func.args {
        FunctionArguments::None => Some(Vec::new()),
        FunctionArguments::Subquery(_) => None,
        FunctionArguments::List(list) => {
            if matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)) {
                return None;
            }
            let mut texts = Vec::with_capacity(list.args.len());
            for arg in &list.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
                        texts.push(expr.to_string());
                    }
                    FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => {
                        texts.push("*".to_string());
                    }
                    _ => return None,
                }
            }
            Some(texts)
        }
    }
}

struct Rewriter<'a> {
    table: &'a str,
    filter: Option<String>,
    stats: Vec<StatColumn>,
}

impl Rewriter<'_> {
    /// Registers a partition statistic and returns its column name.
    fn stat(&mut self, expr: String) -> String {
        self.stat_filtered(expr, self.filter.clone())
    }

    fn stat_filtered(&mut self, expr: String, filter: Option<String>) -> String {
        let sql = match filter {
            Some(f) => format!("{expr} FILTER (WHERE {f})"),
            None => expr,
        };
        let name = format!("s{}", short_hash(&sql));
        if !self.stats.iter().any(|s| s.name == name) {
            self.stats.push(StatColumn {
                name: name.clone(),
                sql,
            });
        }
        name
    }

    /// The global mean of `column`, as a scalar subquery over the base
    /// table.
    fn global_mean(&self, column: &str) -> String {
        format!("(SELECT avg({column}) FROM {})", self.table)
    }

    /// Combines the aggregate's own FILTER with the non-null-pair guard of
    /// the two-column statistics.
    fn pair_filter(&self, x: &str, y: &str) -> String {
        let pair = format!("{x} IS NOT NULL AND {y} IS NOT NULL");
        match &self.filter {
            Some(f) => format!("({f}) AND {pair}"),
            None => pair,
        }
    }

    fn rewrite(mut self, name: &str, args: &[String]) -> Option<AggregateRewrite> {
        let output_sql = match (name, args) {
            ("count", []) => {
                let n = self.stat("count(*)".to_string());
                format!("coalesce(sum({n}), 0)")
            }
            ("count", [x]) => {
                let n = if x == "*" {
                    self.stat("count(*)".to_string())
                } else {
                    self.stat(format!("count({x})"))
                };
                format!("coalesce(sum({n}), 0)")
            }
            ("sum", [x]) => {
                let s = self.stat(format!("sum({x})"));
                format!("sum({s})")
            }
            (
                "min" | "max" | "product" | "bit_and" | "bit_or" | "bit_xor" | "bool_and"
                | "bool_or",
                [x],
            ) => {
                let s = self.stat(format!("{name}({x})"));
                format!("{name}({s})")
            }
            ("avg" | "mean", [x]) => {
                let a = self.stat(format!("avg({x})"));
                let n = self.stat(format!("count({x})"));
                format!("sum({a} * {n}) / sum({n})")
            }
            ("arg_max" | "argmax" | "max_by", [x, y]) => {
                let arg = self.stat(format!("{name}({x}, {y})"));
                let top = self.stat(format!("max({y})"));
                format!("{name}({arg}, {top})")
            }
            ("arg_min" | "argmin" | "min_by", [x, y]) => {
                let arg = self.stat(format!("{name}({x}, {y})"));
                let low = self.stat(format!("min({y})"));
                format!("{name}({arg}, {low})")
            }
            ("variance" | "var_samp" | "var" | "var_pop", [x]) => {
                let total = self.centered_squares(x);
                if name == "var_pop" {
                    format!("({total}) / {}", self.count_term(x))
                } else {
                    format!("({total}) / ({} - 1)", self.count_term(x))
                }
            }
            ("stddev" | "stddev_samp" | "stddev_pop", [x]) => {
                let total = self.centered_squares(x);
                if name == "stddev_pop" {
                    format!("sqrt(({total}) / {})", self.count_term(x))
                } else {
                    format!("sqrt(({total}) / ({} - 1))", self.count_term(x))
                }
            }
            ("covar_samp" | "covar_pop", [x, y]) => {
                let pairs = self.pairs(x, y);
                let sxy = pairs.cross_products(&mut self);
                if name == "covar_pop" {
                    format!("({sxy}) / sum({})", pairs.n(&mut self))
                } else {
                    format!("({sxy}) / (sum({}) - 1)", pairs.n(&mut self))
                }
            }
            ("corr", [x, y]) => {
                let pairs = self.pairs(x, y);
                let sxy = pairs.cross_products(&mut self);
                let sxx = pairs.squares_x(&mut self);
                let syy = pairs.squares_y(&mut self);
                format!("({sxy}) / (sqrt({sxx}) * sqrt({syy}))")
            }
            // The regression family takes (y, x) in standard SQL order.
            ("regr_count", [y, x]) => {
                let pairs = self.pairs(x, y);
                let n = pairs.n(&mut self);
                format!("coalesce(sum({n}), 0)")
            }
            ("regr_avgx", [y, x]) => {
                let pairs = self.pairs(x, y);
                pairs.mean_x(&mut self)
            }
            ("regr_avgy", [y, x]) => {
                let pairs = self.pairs(x, y);
                pairs.mean_y(&mut self)
            }
            ("regr_sxx", [y, x]) => {
                let pairs = self.pairs(x, y);
                pairs.squares_x(&mut self)
            }
            ("regr_syy", [y, x]) => {
                let pairs = self.pairs(x, y);
                pairs.squares_y(&mut self)
            }
            ("regr_sxy", [y, x]) => {
                let pairs = self.pairs(x, y);
                pairs.cross_products(&mut self)
            }
            ("regr_slope", [y, x]) => {
                let pairs = self.pairs(x, y);
                let sxy = pairs.cross_products(&mut self);
                let sxx = pairs.squares_x(&mut self);
                format!("({sxy}) / ({sxx})")
            }
            ("regr_intercept", [y, x]) => {
                let pairs = self.pairs(x, y);
                let sxy = pairs.cross_products(&mut self);
                let sxx = pairs.squares_x(&mut self);
                let mean_x = pairs.mean_x(&mut self);
                let mean_y = pairs.mean_y(&mut self);
                format!("({mean_y}) - (({sxy}) / ({sxx})) * ({mean_x})")
            }
            ("regr_r2", [y, x]) => {
                let pairs = self.pairs(x, y);
                let sxy = pairs.cross_products(&mut self);
                let sxx = pairs.squares_x(&mut self);
                let syy = pairs.squares_y(&mut self);
                format!("(({sxy}) * ({sxy})) / (({sxx}) * ({syy}))")
            }
            _ => return None,
        };
        Some(AggregateRewrite {
            output_sql,
            stats: self.stats,
        })
    }

    /// `Σ(x−x̄)² − (Σ(x−x̄))²/Σn` over the retained partitions.
    fn centered_squares(&mut self, x: &str) -> String {
        let center = self.global_mean(x);
        let ssq = self.stat(format!("sum(({x} - {center}) * ({x} - {center}))"));
        let s = self.stat(format!("sum({x} - {center})"));
        let n = self.stat(format!("count({x})"));
        format!("sum({ssq}) - (sum({s}) * sum({s})) / sum({n})")
    }

    fn count_term(&mut self, x: &str) -> String {
        let n = self.stat(format!("count({x})"));
        format!("sum({n})")
    }

    fn pairs<'p>(&self, x: &'p str, y: &'p str) -> PairStats<'p> {
        PairStats {
            x,
            y,
            filter: self.pair_filter(x, y),
        }
    }
}

/// Shared primitives for the two-column (covariance/regression) family,
/// all filtered to non-null pairs.
struct PairStats<'a> {
    x: &'a str,
    y: &'a str,
    filter: String,
}

impl PairStats<'_> {
    fn n(&self, rw: &mut Rewriter<'_>) -> String {
        rw.stat_filtered("count(*)".to_string(), Some(self.filter.clone()))
    }

    fn centered_sum(&self, rw: &mut Rewriter<'_>, col: &str) -> String {
        let center = rw.global_mean(col);
        rw.stat_filtered(format!("sum({col} - {center})"), Some(self.filter.clone()))
    }

    /// `Σ(x−x̄)(y−ȳ) − Σ(x−x̄)·Σ(y−ȳ)/Σn`.
    fn cross_products(&self, rw: &mut Rewriter<'_>) -> String {
        let cx = rw.global_mean(self.x);
        let cy = rw.global_mean(self.y);
        let sxy = rw.stat_filtered(
            format!("sum(({} - {cx}) * ({} - {cy}))", self.x, self.y),
            Some(self.filter.clone()),
        );
        let sx = self.centered_sum(rw, self.x);
        let sy = self.centered_sum(rw, self.y);
        let n = self.n(rw);
        format!("sum({sxy}) - (sum({sx}) * sum({sy})) / sum({n})")
    }

    fn centered_squares(&self, rw: &mut Rewriter<'_>, col: &str) -> String {
        let center = rw.global_mean(col);
        let ssq = rw.stat_filtered(
            format!("sum(({col} - {center}) * ({col} - {center}))"),
            Some(self.filter.clone()),
        );
        let s = self.centered_sum(rw, col);
        let n = self.n(rw);
        format!("sum({ssq}) - (sum({s}) * sum({s})) / sum({n})")
    }

    fn squares_x(&self, rw: &mut Rewriter<'_>) -> String {
        self.centered_squares(rw, self.x)
    }

    fn squares_y(&self, rw: &mut Rewriter<'_>) -> String {
        self.centered_squares(rw, self.y)
    }

    /// Pair-filtered mean, recovered from the centered sum:
    /// `x̄ + Σ(x−x̄)/Σn`.
    fn mean_x(&self, rw: &mut Rewriter<'_>) -> String {
        let center = rw.global_mean(self.x);
        let s = self.centered_sum(rw, self.x);
        let n = self.n(rw);
        format!("{center} + sum({s}) / sum({n})")
    }

    fn mean_y(&self, rw: &mut Rewriter<'_>) -> String {
        let center = rw.global_mean(self.y);
        let s = self.centered_sum(rw, self.y);
        let n = self.n(rw);
        format!("{center} + sum({s}) / sum({n})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse_expr;
    use sqlparser::ast::Expr;

    fn function(sql: &str) -> Function {
        match parse_expr(sql).unwrap() {
            Expr::Function(func) => func,
            other => panic!("not a function: {other}"),
        }
    }

    fn rewrite(sql: &str) -> AggregateRewrite {
        rewrite_aggregate(&function(sql), "pts").unwrap()
    }

    // -- additive passthrough --

    #[test]
    fn test_count_and_sum_become_partition_sums() {
        let rw = rewrite("count(*)");
        assert_eq!(rw.stats.len(), 1);
        assert_eq!(rw.stats[0].sql, "count(*)");
        assert_eq!(rw.output_sql, format!("coalesce(sum({}), 0)", rw.stats[0].name));

        let rw = rewrite("sum(x)");
        assert_eq!(rw.stats[0].sql, "sum(x)");
        assert_eq!(rw.output_sql, format!("sum({})", rw.stats[0].name));
    }

    #[test]
    fn test_min_max_commute() {
        let rw = rewrite("max(price)");
        assert_eq!(rw.stats[0].sql, "max(price)");
        assert_eq!(rw.output_sql, format!("max({})", rw.stats[0].name));
    }

    #[test]
    fn test_avg_recombines_weighted() {
        let rw = rewrite("avg(x)");
        assert_eq!(rw.stats.len(), 2);
        let a = &rw.stats[0].name;
        let n = &rw.stats[1].name;
        assert_eq!(rw.output_sql, format!("sum({a} * {n}) / sum({n})"));
    }

    #[test]
    fn test_arg_max_carries_extremum() {
        let rw = rewrite("arg_max(label, score)");
        assert_eq!(rw.stats[0].sql, "arg_max(label, score)");
        assert_eq!(rw.stats[1].sql, "max(score)");
        assert!(rw.output_sql.starts_with("arg_max("));
    }

    // -- centered statistics --

    #[test]
    fn test_variance_uses_global_mean_centering() {
        let rw = rewrite("var_samp(x)");
        assert_eq!(rw.stats.len(), 3);
        let center = "(SELECT avg(x) FROM pts)";
        assert_eq!(rw.stats[0].sql, format!("sum((x - {center}) * (x - {center}))"));
        assert_eq!(rw.stats[1].sql, format!("sum(x - {center})"));
        assert_eq!(rw.stats[2].sql, "count(x)");
        assert!(rw.output_sql.ends_with("- 1)"));

        let pop = rewrite("var_pop(x)");
        assert!(!pop.output_sql.ends_with("- 1)"));
        assert!(rewrite("stddev(x)").output_sql.starts_with("sqrt("));
    }

    #[test]
    fn test_covariance_filters_to_non_null_pairs() {
        let rw = rewrite("covar_samp(x, y)");
        for stat in &rw.stats {
            assert!(
                stat.sql.contains("FILTER (WHERE x IS NOT NULL AND y IS NOT NULL)"),
                "stat not pair-filtered: {}",
                stat.sql
            );
        }
        // sxy, sx, sy, n
        assert_eq!(rw.stats.len(), 4);
    }

    #[test]
    fn test_corr_composes_covariance_and_variances() {
        let rw = rewrite("corr(x, y)");
        // sxy, sx, sy, n, sxx, syy
        assert_eq!(rw.stats.len(), 6);
        assert!(rw.output_sql.contains("sqrt"));
    }

    #[test]
    fn test_regression_family_shares_primitives() {
        let slope = rewrite("regr_slope(y, x)");
        let r2 = rewrite("regr_r2(y, x)");
        // Both draw from the same content-addressed primitives.
        for stat in &slope.stats {
            assert!(
                r2.stats.iter().any(|s| s.name == stat.name),
                "slope stat {} missing from r2",
                stat.name
            );
        }
        let intercept = rewrite("regr_intercept(y, x)");
        assert!(intercept.output_sql.contains("(SELECT avg(y) FROM pts)"));
    }

    // -- filter propagation --

    #[test]
    fn test_filter_propagates_to_every_stat() {
        let rw = rewrite("avg(x) FILTER (WHERE g = 2)");
        for stat in &rw.stats {
            assert!(stat.sql.ends_with("FILTER (WHERE g = 2)"), "{}", stat.sql);
        }
    }

    #[test]
    fn test_filter_combines_with_pair_guard() {
        let rw = rewrite("covar_pop(x, y) FILTER (WHERE g = 2)");
        assert!(rw.stats[0]
            .sql
            .contains("(g = 2) AND x IS NOT NULL AND y IS NOT NULL"));
    }

    // -- naming --

    #[test]
    fn test_stat_names_are_content_addressed() {
        let a = rewrite("var_samp(x)");
        let b = rewrite("stddev(x)");
        // Identical underlying statistics resolve to identical names.
        for (sa, sb) in a.stats.iter().zip(&b.stats) {
            assert_eq!(sa.name, sb.name);
        }
    }

    // -- rejection --

    #[test]
    fn test_unsupported_and_distinct_are_rejected() {
        assert!(rewrite_aggregate(&function("median(x)"), "pts").is_none());
        assert!(rewrite_aggregate(&function("count(DISTINCT x)"), "pts").is_none());
        assert!(rewrite_aggregate(&function("string_agg(x, ',')"), "pts").is_none());
        assert!(rewrite_aggregate(&function("sum(x) OVER (PARTITION BY g)"), "pts").is_none());
    }
}
