//! Message-based socket transport.
//!
//! One newline-delimited JSON envelope per request over a persistent TCP
//! connection; requests are serialized on the connection, so this
//! transport answers in submission order. See [`crate::wire`] for the
//! envelope.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use async_trait::async_trait;
use kaleido_core::{Connector, ConnectorError, QueryRequest, QueryResponse};

use crate::wire::{WireRequest, WireResponse};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A [`Connector`] speaking the wire envelope over TCP.
pub struct SocketConnector {
    connection: Mutex<Connection>,
}

impl SocketConnector {
    /// Connects to a backend bridge at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Transport`] if the connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ConnectorError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            connection: Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
            }),
        })
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, ConnectorError> {
        let mut line = serde_json::to_string(&WireRequest::from(&request))
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        line.push('\n');

        let mut connection = self.connection.lock().await;
        connection
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        let mut reply = String::new();
        let read = connection
            .reader
            .read_line(&mut reply)
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        drop(connection);
        if read == 0 {
            return Err(ConnectorError::Transport(
                "connection closed by backend".to_string(),
            ));
        }

        let envelope: WireResponse = serde_json::from_str(reply.trim_end())
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        envelope.into_response(request.kind)
    }
}
