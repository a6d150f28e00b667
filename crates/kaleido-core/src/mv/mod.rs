//! Materialized-view management (pre-aggregation).
//!
//! For each (selection, active clause source) pair, the pre-aggregator
//! decides per client whether a materialized, pre-aggregated view can
//! serve that client's query, creates the view at most once, and rewrites
//! subsequent selection updates into cheap scans of it:
//!
//! ```text
//!  Selection update            PreAggregator                Backend
//!  ───────────────►  plan() ──► analyze + rewrite ──► CREATE TABLE IF NOT
//!                                 │                    EXISTS cube_<hash>
//!  next updates on   plan() ──► reuse entry ────────► SELECT … FROM
//!  the same source                                     cube_<hash> WHERE …
//! ```
//!
//! View names are content-addressed (a hash of the creation query), so
//! textually identical creation queries resolve to one table across
//! clients, selections, and sessions. A change of active source clears the
//! selection's view state; creation failures are logged and the entry
//! stays registered, so later accelerated queries surface the backend
//! error instead of silently falling back.

pub mod bin;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use sqlparser::ast::{GroupByExpr, SetExpr};
use tokio::sync::watch;

use crate::client::{Client, ClientId};
use crate::connector::QueryRequest;
use crate::queue::Priority;
use crate::rewrite::analyze;
use crate::scheduler::QueryScheduler;
use crate::selection::{Clause, ClauseMeta, ClauseValue, Scalar, Scale, Selection, SelectionId};
use crate::sql::{aliased_item, content_hash, parse_expr, quote_ident};
use crate::Result;

use bin::Binning;

/// Configuration for the pre-aggregator.
#[derive(Debug, Clone)]
pub struct PreAggConfig {
    /// Whether acceleration is attempted at all.
    pub enabled: bool,
    /// Backend schema (namespace) holding the materialized views.
    pub schema: String,
}

impl Default for PreAggConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schema: "kaleido".to_string(),
        }
    }
}

/// How a client's next query should be issued.
#[derive(Debug)]
pub enum Plan {
    /// No update needed — the client is the active clause's own source.
    Skip,
    /// Not eligible for acceleration; query directly with the selection's
    /// resolved predicate.
    Direct,
    /// Serve from a materialized view.
    Accelerated(AcceleratedQuery),
}

/// An accelerated query plus the readiness signal of its backing view.
#[derive(Debug)]
pub struct AcceleratedQuery {
    /// The SELECT against the materialized view.
    pub sql: String,
    ready: watch::Receiver<bool>,
}

impl AcceleratedQuery {
    /// Waits until the view creation has settled (successfully or not).
    pub async fn ready(&mut self) {
        while !*self.ready.borrow() {
            if self.ready.changed().await.is_err() {
                break;
            }
        }
    }
}

/// One "active dimension" column of a view.
#[derive(Debug, Clone)]
enum ActiveColumn {
    /// Point selection: the raw predicate column, unbinned.
    Point { column: String },
    /// Interval selection: a pixel-binned scale transform.
    Bin {
        name: String,
        scale: Scale,
        binning: Binning,
    },
}

impl ActiveColumn {
    fn name(&self) -> String {
        match self {
            Self::Point { column } => column.clone(),
            Self::Bin { name, .. } => name.clone(),
        }
    }

    fn expr_sql(&self) -> String {
        match self {
            Self::Point { column } => column.clone(),
            Self::Bin { scale, binning, .. } => binning.sql(scale),
        }
    }
}

#[derive(Debug, Clone)]
struct CubeEntry {
    qualified: String,
    select_list: String,
    group_by: Option<String>,
    order_by: Option<String>,
    table: String,
}

struct SelectionCubes {
    source: String,
    active: Option<Arc<Vec<ActiveColumn>>>,
    entries: FxHashMap<ClientId, Option<Arc<CubeEntry>>>,
    tables: Vec<String>,
}

impl SelectionCubes {
    fn new(clause: &Clause) -> Self {
        Self {
            source: clause.source.clone(),
            active: derive_active_columns(clause).map(Arc::new),
            entries: FxHashMap::default(),
            tables: Vec::new(),
        }
    }
}

#[derive(Default)]
struct State {
    selections: FxHashMap<SelectionId, SelectionCubes>,
    created: FxHashMap<String, watch::Receiver<bool>>,
    schema_ready: Option<watch::Receiver<bool>>,
}

/// Owns the lifecycle of per-client materialized views.
pub struct PreAggregator {
    scheduler: QueryScheduler,
    schema: String,
    enabled: AtomicBool,
    state: Mutex<State>,
}

impl PreAggregator {
    /// Creates a pre-aggregator issuing its queries through `scheduler`.
    #[must_use]
    pub fn new(scheduler: QueryScheduler, config: PreAggConfig) -> Self {
        Self {
            scheduler,
            schema: config.schema,
            enabled: AtomicBool::new(config.enabled),
            state: Mutex::new(State::default()),
        }
    }

    /// Whether acceleration is currently attempted.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toggles acceleration without dropping existing views.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// The backend namespace holding the views.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Plans the next query for `client` under `selection`.
    pub fn plan(&self, id: ClientId, client: &dyn Client, selection: &Selection) -> Plan {
        let Some(active) = selection.active() else {
            return Plan::Direct;
        };
        if selection.skip(id, &active) {
            return Plan::Skip;
        }
        if !self.enabled() {
            return Plan::Direct;
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let cubes = state
            .selections
            .entry(selection.id())
            .or_insert_with(|| SelectionCubes::new(&active));

        // A change of active source clears all view state for the
        // selection; in-flight creations for the superseded source are
        // forgotten (exec dispatches cannot be aborted mid-flight).
        if cubes.source != active.source {
            for table in &cubes.tables {
                state.created.remove(table);
            }
            *cubes = SelectionCubes::new(&active);
        } else if cubes.active.is_none() && active.meta.is_some() {
            // The source was cached as ineligible but now carries
            // metadata (e.g. the selection was cleared in between).
            *cubes = SelectionCubes::new(&active);
        }

        let Some(active_columns) = cubes.active.clone() else {
            // No usable metadata on this source; cached as ineligible
            // until the source changes or the selection is cleared.
            return Plan::Direct;
        };

        let existing = cubes.entries.get(&id).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let built = build_entry(
                    &self.scheduler,
                    &self.schema,
                    state,
                    id,
                    client,
                    selection,
                    &active,
                    &active_columns,
                );
                let cubes = state
                    .selections
                    .get_mut(&selection.id())
                    .expect("selection state just inserted");
                if let Some(entry) = &built {
                    cubes.tables.push(entry.table.clone());
                }
                cubes.entries.insert(id, built.clone());
                built
            }
        };
        let Some(entry) = entry else {
            return Plan::Direct;
        };

        let predicate = match active_predicate(&active_columns, &active) {
            PredicateOutcome::Where(text) => Some(text),
            PredicateOutcome::All => None,
            PredicateOutcome::Incompatible => return Plan::Direct,
        };

        let mut sql = format!("SELECT {} FROM {}", entry.select_list, entry.qualified);
        if let Some(predicate) = predicate {
            sql.push_str(&format!(" WHERE {predicate}"));
        }
        if let Some(group_by) = &entry.group_by {
            sql.push_str(&format!(" GROUP BY {group_by}"));
        }
        if let Some(order_by) = &entry.order_by {
            sql.push_str(&format!(" ORDER BY {order_by}"));
        }

        let ready = state
            .created
            .get(&entry.table)
            .cloned()
            .unwrap_or_else(|| watch::channel(true).1);
        Plan::Accelerated(AcceleratedQuery { sql, ready })
    }

    /// Prepares view state for an activation hint, without producing a
    /// query. Used to warm the view before the first `value` event.
    pub fn prepare(&self, id: ClientId, client: &dyn Client, selection: &Selection) {
        let Some(clause) = selection.last_activation() else {
            return;
        };
        if !self.enabled() || selection.skip(id, &clause) {
            return;
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let cubes = state
            .selections
            .entry(selection.id())
            .or_insert_with(|| SelectionCubes::new(&clause));
        if cubes.source != clause.source {
            for table in &cubes.tables {
                state.created.remove(table);
            }
            *cubes = SelectionCubes::new(&clause);
        }
        let Some(active_columns) = cubes.active.clone() else {
            return;
        };
        if cubes.entries.contains_key(&id) {
            return;
        }
        let built = build_entry(
            &self.scheduler,
            &self.schema,
            state,
            id,
            client,
            selection,
            &clause,
            &active_columns,
        );
        let cubes = state
            .selections
            .get_mut(&selection.id())
            .expect("selection state just inserted");
        if let Some(entry) = &built {
            cubes.tables.push(entry.table.clone());
        }
        cubes.entries.insert(id, built);
    }

    /// Forgets all per-client state for a disconnected client.
    pub fn forget_client(&self, id: ClientId) {
        let mut state = self.state.lock();
        for cubes in state.selections.values_mut() {
            cubes.entries.remove(&id);
        }
    }

    /// Drops every view this pre-aggregator created and clears local
    /// state. Destructive and explicit; there is no automatic staleness
    /// detection.
    ///
    /// # Errors
    ///
    /// Returns the first backend error encountered.
    pub async fn drop_materialized_views(&self) -> Result<()> {
        let tables: Vec<String> = {
            let mut state = self.state.lock();
            let tables = state.created.keys().cloned().collect();
            state.selections.clear();
            state.created.clear();
            tables
        };
        for table in tables {
            self.scheduler
                .request(
                    QueryRequest::exec(format!(
                        "DROP TABLE IF EXISTS {}.{table}",
                        self.schema
                    )),
                    Priority::Normal,
                )
                .await?;
        }
        Ok(())
    }

    /// Drops the whole view namespace (`DROP SCHEMA … CASCADE`) and clears
    /// local state. Used when base tables have been mutated and every view
    /// is stale.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the drop fails.
    pub async fn drop_schema(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.selections.clear();
            state.created.clear();
            state.schema_ready = None;
        }
        self.scheduler
            .request(
                QueryRequest::exec(format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema)),
                Priority::Normal,
            )
            .await?;
        Ok(())
    }
}

/// Derives the active dimension columns from a clause's metadata.
///
/// `None` marks the source ineligible: no metadata, a `match` shape, or a
/// degenerate scale.
fn derive_active_columns(clause: &Clause) -> Option<Vec<ActiveColumn>> {
    match clause.meta.as_ref()? {
        ClauseMeta::Point { columns } => {
            if columns.is_empty() {
                return None;
            }
            Some(
                columns
                    .iter()
                    .map(|column| ActiveColumn::Point {
                        column: column.clone(),
                    })
                    .collect(),
            )
        }
        ClauseMeta::Interval {
            scales,
            pixel_size,
            policy,
        } => {
            if scales.is_empty() {
                return None;
            }
            scales
                .iter()
                .enumerate()
                .map(|(index, scale)| {
                    Binning::derive(scale, *pixel_size, *policy).map(|binning| ActiveColumn::Bin {
                        name: format!("active{index}"),
                        scale: scale.clone(),
                        binning,
                    })
                })
                .collect()
        }
        ClauseMeta::Match { .. } => None,
    }
}

enum PredicateOutcome {
    Where(String),
    All,
    Incompatible,
}

/// Renders the active clause's predicate over the view's active columns.
fn active_predicate(columns: &[ActiveColumn], clause: &Clause) -> PredicateOutcome {
    let Some(value) = &clause.value else {
        return PredicateOutcome::All;
    };
    match (columns, value) {
        ([ActiveColumn::Point { column }], ClauseValue::Scalar(scalar)) => {
            PredicateOutcome::Where(point_equality(column, scalar))
        }
        ([ActiveColumn::Point { column }], ClauseValue::List(values)) => {
            let list: Vec<String> = values.iter().map(Scalar::to_sql).collect();
            PredicateOutcome::Where(format!("{column} IN ({})", list.join(", ")))
        }
        (points, ClauseValue::List(values))
            if points.len() == values.len()
                && points
                    .iter()
                    .all(|c| matches!(c, ActiveColumn::Point { .. })) =>
        {
            let conjunction: Vec<String> = points
                .iter()
                .zip(values)
                .map(|(column, scalar)| point_equality(&column.name(), scalar))
                .collect();
            PredicateOutcome::Where(conjunction.join(" AND "))
        }
        (bins, ClauseValue::Intervals(ranges)) if bins.len() == ranges.len() => {
            let mut parts = Vec::with_capacity(bins.len());
            for (column, (lo, hi)) in bins.iter().zip(ranges) {
                let ActiveColumn::Bin { name, scale, binning } = column else {
                    return PredicateOutcome::Incompatible;
                };
                let mut lo_bin = binning.index(scale, *lo);
                let mut hi_bin = binning.index(scale, *hi);
                if lo_bin > hi_bin {
                    std::mem::swap(&mut lo_bin, &mut hi_bin);
                }
                parts.push(format!("{name} BETWEEN {lo_bin} AND {hi_bin}"));
            }
            PredicateOutcome::Where(parts.join(" AND "))
        }
        _ => PredicateOutcome::Incompatible,
    }
}

fn point_equality(column: &str, scalar: &Scalar) -> String {
    match scalar {
        Scalar::Null => format!("{column} IS NULL"),
        other => format!("{column} = {}", other.to_sql()),
    }
}

/// Analyzes the client query and, when eligible, registers its view and
/// issues the at-most-once creation.
#[allow(clippy::too_many_arguments)]
fn build_entry(
    scheduler: &QueryScheduler,
    schema: &str,
    state: &mut State,
    id: ClientId,
    client: &dyn Client,
    selection: &Selection,
    active: &Clause,
    active_columns: &[ActiveColumn],
) -> Option<Arc<CubeEntry>> {
    // The creation query is filtered by the selection with the active
    // source removed, so the view stays valid across updates of that
    // source.
    let filter = selection
        .remove(&active.source)
        .predicate(Some(id))
        .unwrap_or_default();
    let query = client.query(&filter)?;
    let analysis = analyze(&query)?;

    let mut base = analysis.base.clone();
    let SetExpr::Select(select) = base.body.as_mut() else {
        return None;
    };
    let mut projection = Vec::new();
    let mut group_exprs = Vec::new();
    for dimension in &analysis.dimensions {
        projection.push(aliased_item(&dimension.sql, &dimension.alias).ok()?);
        group_exprs.push(parse_expr(&dimension.sql).ok()?);
    }
    for column in active_columns {
        let expr_sql = column.expr_sql();
        projection.push(aliased_item(&expr_sql, &column.name()).ok()?);
        group_exprs.push(parse_expr(&expr_sql).ok()?);
    }
    for stat in &analysis.stats {
        projection.push(aliased_item(&stat.sql, &stat.name).ok()?);
    }
    select.projection = projection;
    select.group_by = GroupByExpr::Expressions(group_exprs, Vec::new());
    base.order_by = None;

    let inner = base.to_string();
    let table = format!("cube_{}", content_hash(&inner));
    let qualified = format!("{schema}.{table}");

    let mut select_list: Vec<String> = analysis
        .dimensions
        .iter()
        .map(|d| quote_ident(&d.alias))
        .collect();
    select_list.extend(
        analysis
            .outputs
            .iter()
            .map(|o| format!("{} AS {}", o.sql, quote_ident(&o.alias))),
    );
    let group_by = (!analysis.dimensions.is_empty()).then(|| {
        analysis
            .dimensions
            .iter()
            .map(|d| quote_ident(&d.alias))
            .collect::<Vec<_>>()
            .join(", ")
    });

    let entry = Arc::new(CubeEntry {
        qualified: qualified.clone(),
        select_list: select_list.join(", "),
        group_by,
        order_by: analysis.order_by.clone(),
        table: table.clone(),
    });

    // At-most-once creation; textually identical creation queries share
    // one in-flight result.
    if !state.created.contains_key(&table) {
        let schema_ready = ensure_schema(scheduler, schema, state);
        let (done_tx, done_rx) = watch::channel(false);
        state.created.insert(table.clone(), done_rx);

        let create_sql = format!("CREATE TABLE IF NOT EXISTS {qualified} AS {inner}");
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut schema_ready = schema_ready;
            while !*schema_ready.borrow() {
                if schema_ready.changed().await.is_err() {
                    break;
                }
            }
            tracing::debug!(table = %table, "creating materialized view");
            let result = scheduler.request(QueryRequest::exec(create_sql), Priority::High);
            if let Err(err) = result.await {
                // No automatic fallback: the entry stays registered and
                // later accelerated queries surface the backend failure.
                tracing::error!(table = %table, error = %err, "materialized view creation failed");
            }
            done_tx.send_replace(true);
        });
    }

    Some(entry)
}

/// Issues `CREATE SCHEMA IF NOT EXISTS` once per pre-aggregator.
fn ensure_schema(
    scheduler: &QueryScheduler,
    schema: &str,
    state: &mut State,
) -> watch::Receiver<bool> {
    if let Some(rx) = &state.schema_ready {
        return rx.clone();
    }
    let (tx, rx) = watch::channel(false);
    state.schema_ready = Some(rx.clone());
    let result = scheduler.request(
        QueryRequest::exec(format!("CREATE SCHEMA IF NOT EXISTS {schema}")),
        Priority::High,
    );
    tokio::spawn(async move {
        if let Err(err) = result.await {
            tracing::debug!(error = %err, "schema creation failed");
        }
        tx.send_replace(true);
    });
    rx
}
