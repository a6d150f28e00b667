//! Coordinator update protocol: field-info bootstrap, crossfilter skip,
//! materialized-view acceleration, view reuse, and error delivery.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlparser::ast::{BinaryOperator, Expr, Query, SetExpr};

use kaleido_core::sql::parse_query;
use kaleido_core::testing::MockConnector;
use kaleido_core::{
    BinPolicy, Clause, ClauseMeta, ClauseValue, Client, ClientId, Coordinator, Error, FieldInfo,
    FieldRequest, QueryResponse, Scale, Selection, Stat,
};

/// A chart-like client: a fixed aggregate query, filtered by conjunction,
/// recording every callback.
struct ChartClient {
    sql: String,
    selection: Option<Selection>,
    fields: Vec<FieldRequest>,
    events: Mutex<Vec<String>>,
}

impl ChartClient {
    fn new(sql: &str, selection: Option<Selection>) -> Arc<Self> {
        Arc::new(Self {
            sql: sql.to_string(),
            selection,
            fields: Vec::new(),
            events: Mutex::new(Vec::new()),
        })
    }

    fn with_fields(sql: &str, fields: Vec<FieldRequest>) -> Arc<Self> {
        Arc::new(Self {
            sql: sql.to_string(),
            selection: None,
            fields,
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

fn conjoin(filter: &[Expr]) -> Expr {
    filter
        .iter()
        .cloned()
        .reduce(|left, right| Expr::BinaryOp {
            left: Box::new(left),
            op: BinaryOperator::And,
            right: Box::new(right),
        })
        .expect("non-empty filter")
}

impl Client for ChartClient {
    fn fields(&self) -> Vec<FieldRequest> {
        self.fields.clone()
    }

    fn field_info(&self, info: &[FieldInfo]) {
        for field in info {
            self.events
                .lock()
                .push(format!("fields:{}:{}", field.column, field.stats.len()));
        }
    }

    fn query(&self, filter: &[Expr]) -> Option<Query> {
        let mut query = parse_query(&self.sql).expect("client query parses");
        if !filter.is_empty() {
            if let SetExpr::Select(select) = query.body.as_mut() {
                select.selection = Some(conjoin(filter));
            }
        }
        Some(*query)
    }

    fn query_pending(&self) {
        self.events.lock().push("pending".to_string());
    }

    fn query_result(&self, data: &QueryResponse) {
        let rows = data.table().map_or(0, arrow::array::RecordBatch::num_rows);
        self.events.lock().push(format!("result:{rows}"));
    }

    fn query_error(&self, error: &Error) {
        self.events.lock().push(format!("error:{error}"));
    }

    fn filter_by(&self) -> Option<Selection> {
        self.selection.clone()
    }
}

fn interval_clause(source: &str, client: ClientId, range: (f64, f64)) -> Clause {
    Clause::new(source)
        .with_client(client)
        .with_value(ClauseValue::Intervals(vec![range]))
        .with_predicate(
            kaleido_core::sql::parse_expr(&format!(
                "amount BETWEEN {} AND {}",
                range.0, range.1
            ))
            .unwrap(),
        )
        .with_meta(ClauseMeta::Interval {
            scales: vec![Scale::linear("amount", (0.0, 100.0), (0.0, 200.0))],
            pixel_size: 1.0,
            policy: BinPolicy::Floor,
        })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// -- connect / field info --

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_delivers_field_info_then_initial_result() {
    let connector = Arc::new(MockConnector::new());
    let coordinator = Coordinator::new(connector);

    let chart = ChartClient::with_fields(
        "SELECT category, count(*) AS n FROM sales GROUP BY category",
        vec![FieldRequest::new("sales", "amount", vec![Stat::Min, Stat::Max])],
    );
    coordinator.connect_client(chart.clone()).await.unwrap();

    let events = chart.events();
    assert_eq!(events[0], "fields:amount:1");
    assert_eq!(events[1], "pending");
    assert_eq!(events[2], "result:3");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_double_connect_is_an_error() {
    let connector = Arc::new(MockConnector::new());
    let coordinator = Coordinator::new(connector);

    let chart = ChartClient::new("SELECT count(*) AS n FROM sales", None);
    coordinator.connect_client(chart.clone()).await.unwrap();
    let err = coordinator.connect_client(chart).await.unwrap_err();
    assert!(matches!(err, Error::ClientAlreadyConnected(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backend_failure_reaches_query_error() {
    let connector = Arc::new(MockConnector::new());
    connector.fail("SELECT count(*) AS n FROM sales", "relation missing");
    let coordinator = Coordinator::new(connector);

    let chart = ChartClient::new("SELECT count(*) AS n FROM sales", None);
    coordinator.connect_client(chart.clone()).await.unwrap();

    let events = chart.events();
    assert_eq!(events[0], "pending");
    assert!(events[1].starts_with("error:"), "{events:?}");
}

// -- crossfilter + acceleration --

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crossfilter_updates_skip_the_active_source() {
    let connector = Arc::new(MockConnector::new());
    let coordinator = Coordinator::new(connector);
    let selection = Selection::crossfilter();

    let chart1 = ChartClient::new(
        "SELECT category, count(*) AS n FROM sales GROUP BY category",
        Some(selection.clone()),
    );
    let chart2 = ChartClient::new(
        "SELECT day, sum(amount) AS total FROM sales GROUP BY day",
        Some(selection.clone()),
    );
    let id1 = coordinator.connect_client(chart1.clone()).await.unwrap();
    let id2 = coordinator.connect_client(chart2.clone()).await.unwrap();
    let baseline1 = chart1.events().len();
    let baseline2 = chart2.events().len();

    selection.update(interval_clause("brush-1", id1, (10.0, 30.0)));
    settle().await;

    // The publishing client is never filtered by its own clause.
    assert!(selection.predicate(Some(id1)).is_none());
    assert_eq!(selection.predicate(Some(id2)).unwrap().len(), 1);

    // chart1 received no new events; chart2 got pending + result.
    assert_eq!(chart1.events().len(), baseline1);
    let events2 = chart2.events();
    assert_eq!(&events2[baseline2..], ["pending", "result:3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interval_selection_builds_and_reuses_a_view() {
    let connector = Arc::new(MockConnector::new());
    let coordinator = Coordinator::new(connector.clone());
    let recorder = coordinator.scheduler().record();
    let selection = Selection::crossfilter();

    let publisher = ChartClient::new(
        "SELECT category, count(*) AS n FROM sales GROUP BY category",
        Some(selection.clone()),
    );
    let chart = ChartClient::new(
        "SELECT day, sum(amount) AS total FROM sales GROUP BY day",
        Some(selection.clone()),
    );
    let publisher_id = coordinator.connect_client(publisher).await.unwrap();
    coordinator.connect_client(chart.clone()).await.unwrap();
    let _ = recorder.take();

    selection.update(interval_clause("brush-1", publisher_id, (10.0, 30.0)));
    settle().await;

    let dispatched = recorder.take();
    let creations: Vec<_> = dispatched
        .iter()
        .filter(|sql| sql.starts_with("CREATE TABLE IF NOT EXISTS kaleido.cube_"))
        .collect();
    assert_eq!(creations.len(), 1, "one view creation: {dispatched:?}");
    assert!(
        dispatched
            .iter()
            .any(|sql| sql.starts_with("SELECT") && sql.contains("kaleido.cube_")
                && sql.contains("active0 BETWEEN")),
        "accelerated select missing: {dispatched:?}"
    );

    // Another update on the same source reuses the view: no new CREATE.
    selection.update(interval_clause("brush-1", publisher_id, (20.0, 60.0)));
    settle().await;
    let dispatched = recorder.take();
    assert!(
        dispatched
            .iter()
            .all(|sql| !sql.starts_with("CREATE TABLE")),
        "view was rebuilt: {dispatched:?}"
    );
    assert!(dispatched.iter().any(|sql| sql.contains("kaleido.cube_")));

    // The chart saw two accelerated updates.
    let results = chart
        .events()
        .iter()
        .filter(|e| e.starts_with("result:"))
        .count();
    assert_eq!(results, 3); // initial + two brush updates
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_preaggregation_falls_back_to_direct() {
    let connector = Arc::new(MockConnector::new());
    let coordinator = Coordinator::new(connector);
    coordinator.preaggregator().set_enabled(false);
    let recorder = coordinator.scheduler().record();
    let selection = Selection::crossfilter();

    let publisher = ChartClient::new(
        "SELECT category, count(*) AS n FROM sales GROUP BY category",
        Some(selection.clone()),
    );
    let chart = ChartClient::new(
        "SELECT day, sum(amount) AS total FROM sales GROUP BY day",
        Some(selection.clone()),
    );
    let publisher_id = coordinator.connect_client(publisher).await.unwrap();
    coordinator.connect_client(chart.clone()).await.unwrap();

    selection.update(interval_clause("brush-1", publisher_id, (10.0, 30.0)));
    settle().await;

    let dispatched = recorder.take();
    assert!(dispatched.iter().all(|sql| !sql.contains("cube_")));
    // The direct query carries the clause predicate.
    assert!(
        dispatched
            .iter()
            .any(|sql| sql.contains("WHERE amount BETWEEN 10 AND 30")),
        "direct filtered query missing: {dispatched:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_stops_updates() {
    let connector = Arc::new(MockConnector::new());
    let coordinator = Coordinator::new(connector);
    let selection = Selection::intersect();

    let chart = ChartClient::new(
        "SELECT day, sum(amount) AS total FROM sales GROUP BY day",
        Some(selection.clone()),
    );
    let id = coordinator.connect_client(chart.clone()).await.unwrap();
    let baseline = chart.events().len();

    coordinator.disconnect_client(id).unwrap();
    selection.update(interval_clause("brush-1", ClientId::from_raw(99), (0.0, 5.0)));
    settle().await;

    assert_eq!(chart.events().len(), baseline);
    assert!(matches!(
        coordinator.disconnect_client(id),
        Err(Error::ClientNotFound(_))
    ));
}
