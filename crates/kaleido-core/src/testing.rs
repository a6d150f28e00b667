//! Testing utilities.
//!
//! Provides a scriptable mock [`Connector`] plus batch helpers for unit
//! and integration tests of the scheduler, coordinator, and
//! pre-aggregator. Not intended for production use, but kept in the crate
//! so downstream crates can test against the same contract.

use std::sync::Arc;

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::connector::{Connector, ConnectorError, QueryKind, QueryRequest, QueryResponse};

/// Produces a columnar response for a dispatched SQL string.
pub type ColumnarHandler =
    Arc<dyn Fn(&str) -> std::result::Result<RecordBatch, String> + Send + Sync>;

/// Creates a test schema with `id` (Int64) and `value` (Utf8) columns.
#[must_use]
pub fn mock_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("value", DataType::Utf8, false),
    ]))
}

/// Creates a test `RecordBatch` with `n` rows.
///
/// # Panics
///
/// Panics if the batch cannot be created (should not happen with valid
/// inputs).
#[must_use]
pub fn mock_batch(n: usize) -> RecordBatch {
    #[allow(clippy::cast_possible_wrap)]
    let ids: Vec<i64> = (0..n as i64).collect();
    let values: Vec<String> = (0..n).map(|i| format!("value_{i}")).collect();
    let value_refs: Vec<&str> = values.iter().map(String::as_str).collect();

    RecordBatch::try_new(
        mock_schema(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(value_refs)),
        ],
    )
    .unwrap()
}

/// Releases one held query on a [`MockConnector`].
pub struct Release {
    tx: watch::Sender<bool>,
}

impl Release {
    /// Lets the held query complete.
    pub fn release(&self) {
        self.tx.send_replace(true);
    }
}

/// Scriptable mock backend connector.
///
/// By default every request succeeds with a shape-appropriate canned
/// response. Tests can script exact-SQL responses or failures, install a
/// columnar handler that builds a batch from the dispatched SQL, and hold
/// individual queries to control backend completion order.
#[derive(Default)]
pub struct MockConnector {
    responses: Mutex<FxHashMap<String, QueryResponse>>,
    failures: Mutex<FxHashMap<String, String>>,
    holds: Mutex<FxHashMap<String, watch::Receiver<bool>>>,
    handler: Mutex<Option<ColumnarHandler>>,
    log: Mutex<Vec<QueryRequest>>,
}

impl MockConnector {
    /// Creates a mock connector with default canned responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts an exact-SQL response.
    pub fn respond_with(&self, sql: impl Into<String>, response: QueryResponse) {
        self.responses.lock().insert(sql.into(), response);
    }

    /// Scripts an exact-SQL failure.
    pub fn fail(&self, sql: impl Into<String>, message: impl Into<String>) {
        self.failures.lock().insert(sql.into(), message.into());
    }

    /// Installs a handler that builds columnar responses from SQL text.
    pub fn with_columnar_handler(&self, handler: ColumnarHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Holds the given SQL until the returned [`Release`] fires.
    #[must_use]
    pub fn hold(&self, sql: impl Into<String>) -> Release {
        let (tx, rx) = watch::channel(false);
        self.holds.lock().insert(sql.into(), rx);
        Release { tx }
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.log.lock().clone()
    }

    /// The SQL of every request received, in arrival order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<String> {
        self.log.lock().iter().map(|r| r.sql.clone()).collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, ConnectorError> {
        self.log.lock().push(request.clone());

        let hold = self.holds.lock().get(&request.sql).cloned();
        if let Some(mut rx) = hold {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        if let Some(message) = self.failures.lock().get(&request.sql) {
            return Err(ConnectorError::Backend(message.clone()));
        }
        if let Some(response) = self.responses.lock().get(&request.sql) {
            return Ok(response.clone());
        }
        if request.kind == QueryKind::Columnar {
            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                return handler(&request.sql)
                    .map(QueryResponse::Table)
                    .map_err(ConnectorError::Backend);
            }
        }

        Ok(match request.kind {
            QueryKind::Exec => QueryResponse::Exec,
            QueryKind::Columnar => QueryResponse::Table(mock_batch(3)),
            QueryKind::Json => QueryResponse::Rows(vec![serde_json::json!({ "mock": true })]),
        })
    }
}
