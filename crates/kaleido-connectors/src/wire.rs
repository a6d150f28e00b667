//! The JSON wire envelope shared by the socket and HTTP transports.
//!
//! One request/response pair per message. Columnar payloads are encoded
//! as base64 Arrow IPC streams so the envelope stays valid JSON on any
//! transport; exec and row results ride the envelope directly.

use std::io::Cursor;

use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use kaleido_core::{ConnectorError, QueryKind, QueryRequest, QueryResponse};

/// A query request on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    /// Result shape: `"exec"`, `"columnar"`, or `"json"`.
    pub kind: String,
    /// Backend SQL text.
    pub sql: String,
}

impl From<&QueryRequest> for WireRequest {
    fn from(request: &QueryRequest) -> Self {
        Self {
            kind: request.kind.to_string(),
            sql: request.sql.clone(),
        }
    }
}

impl WireRequest {
    /// Reconstructs the request, defaulting unknown kinds to `exec`.
    #[must_use]
    pub fn kind(&self) -> QueryKind {
        match self.kind.as_str() {
            "columnar" => QueryKind::Columnar,
            "json" => QueryKind::Json,
            _ => QueryKind::Exec,
        }
    }
}

/// A query response on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    /// Whether the backend accepted the query.
    pub ok: bool,
    /// Error message when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Base64 Arrow IPC stream for columnar results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Row objects for JSON results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Value>>,
}

impl WireResponse {
    /// Wraps a successful backend answer.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Transport`] if a batch cannot be encoded.
    pub fn success(response: &QueryResponse) -> Result<Self, ConnectorError> {
        Ok(match response {
            QueryResponse::Exec => Self {
                ok: true,
                error: None,
                data: None,
                rows: None,
            },
            QueryResponse::Rows(rows) => Self {
                ok: true,
                error: None,
                data: None,
                rows: Some(rows.clone()),
            },
            QueryResponse::Table(batch) => Self {
                ok: true,
                error: None,
                data: Some(encode_batch(batch)?),
                rows: None,
            },
        })
    }

    /// Wraps a backend failure.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            data: None,
            rows: None,
        }
    }

    /// Unwraps the envelope back into a [`QueryResponse`], shaped by the
    /// request kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Backend`] for `ok: false` envelopes and
    /// [`ConnectorError::Transport`] for malformed payloads.
    pub fn into_response(self, kind: QueryKind) -> Result<QueryResponse, ConnectorError> {
        if !self.ok {
            return Err(ConnectorError::Backend(
                self.error.unwrap_or_else(|| "unknown backend error".to_string()),
            ));
        }
        match kind {
            QueryKind::Exec => Ok(QueryResponse::Exec),
            QueryKind::Json => Ok(QueryResponse::Rows(self.rows.unwrap_or_default())),
            QueryKind::Columnar => {
                let data = self.data.ok_or_else(|| {
                    ConnectorError::Transport("columnar response without data".to_string())
                })?;
                Ok(QueryResponse::Table(decode_batch(&data)?))
            }
        }
    }
}

/// Encodes a record batch as a base64 Arrow IPC stream.
///
/// # Errors
///
/// Returns [`ConnectorError::Transport`] on IPC failures.
pub fn encode_batch(batch: &RecordBatch) -> Result<String, ConnectorError> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &batch.schema()).map_err(transport)?;
        writer.write(batch).map_err(transport)?;
        writer.finish().map_err(transport)?;
    }
    Ok(BASE64.encode(buf))
}

/// Decodes a record batch from a base64 Arrow IPC stream.
///
/// # Errors
///
/// Returns [`ConnectorError::Transport`] on malformed payloads.
pub fn decode_batch(encoded: &str) -> Result<RecordBatch, ConnectorError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ConnectorError::Transport(e.to_string()))?;
    let reader = StreamReader::try_new(Cursor::new(bytes), None).map_err(transport)?;
    let mut batches: Vec<RecordBatch> = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(transport)?);
    }
    match batches.first() {
        Some(first) => {
            arrow::compute::concat_batches(&first.schema(), &batches).map_err(transport)
        }
        None => Err(ConnectorError::Transport("empty IPC stream".to_string())),
    }
}

fn transport(err: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Transport(err.to_string())
}
