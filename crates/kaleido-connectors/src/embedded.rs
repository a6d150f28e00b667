//! In-process connector over an embedded DataFusion engine.
//!
//! Useful for tests, demos, and single-process deployments: the
//! coordinator's generated SQL (view creation included) runs against a
//! `SessionContext` owned by this connector.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::Schema;
use async_trait::async_trait;
use datafusion::prelude::SessionContext;

use kaleido_core::{Connector, ConnectorError, QueryKind, QueryRequest, QueryResponse};

/// A [`Connector`] executing queries on an embedded DataFusion context.
pub struct EmbeddedConnector {
    ctx: SessionContext,
}

impl Default for EmbeddedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedConnector {
    /// Creates a connector over a fresh session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
        }
    }

    /// Creates a connector over an existing session (shared catalogs).
    #[must_use]
    pub fn with_context(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// The underlying session, for registering tables directly.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    async fn collect(&self, sql: &str) -> Result<Vec<RecordBatch>, ConnectorError> {
        let df = self
            .ctx
            .sql(sql)
            .await
            .map_err(|e| ConnectorError::Backend(e.to_string()))?;
        df.collect()
            .await
            .map_err(|e| ConnectorError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Connector for EmbeddedConnector {
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, ConnectorError> {
        tracing::trace!(kind = %request.kind, sql = %request.sql, "embedded query");
        let batches = self.collect(&request.sql).await?;
        match request.kind {
            QueryKind::Exec => Ok(QueryResponse::Exec),
            QueryKind::Columnar => Ok(QueryResponse::Table(concat(&batches)?)),
            QueryKind::Json => Ok(QueryResponse::Rows(to_rows(&batches)?)),
        }
    }
}

fn concat(batches: &[RecordBatch]) -> Result<RecordBatch, ConnectorError> {
    match batches.first() {
        Some(first) => arrow::compute::concat_batches(&first.schema(), batches)
            .map_err(|e| ConnectorError::Backend(e.to_string())),
        None => Ok(RecordBatch::new_empty(Arc::new(Schema::empty()))),
    }
}

fn to_rows(batches: &[RecordBatch]) -> Result<Vec<serde_json::Value>, ConnectorError> {
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    let mut writer = arrow::json::ArrayWriter::new(Vec::new());
    writer
        .write_batches(&refs)
        .map_err(|e| ConnectorError::Backend(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| ConnectorError::Backend(e.to_string()))?;
    let data = writer.into_inner();
    if data.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&data).map_err(|e| ConnectorError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_then_columnar() {
        let connector = EmbeddedConnector::new();
        connector
            .query(QueryRequest::exec(
                "CREATE TABLE t AS SELECT column1 AS v FROM (VALUES (1), (2), (3))",
            ))
            .await
            .unwrap();

        let response = connector
            .query(QueryRequest::columnar("SELECT sum(v) AS total FROM t"))
            .await
            .unwrap();
        let batch = response.table().unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.schema().field(0).name(), "total");
    }

    #[tokio::test]
    async fn test_json_rows() {
        let connector = EmbeddedConnector::new();
        let response = connector
            .query(QueryRequest::json("SELECT 1 AS a, 'x' AS b"))
            .await
            .unwrap();
        let rows = response.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], 1);
        assert_eq!(rows[0]["b"], "x");
    }

    #[tokio::test]
    async fn test_backend_error_surfaces() {
        let connector = EmbeddedConnector::new();
        let err = connector
            .query(QueryRequest::columnar("SELECT * FROM missing_table"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Backend(_)));
    }
}
