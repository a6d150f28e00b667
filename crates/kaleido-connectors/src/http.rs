//! HTTP transport.
//!
//! Each request is one POST of the JSON wire envelope; unlike the socket
//! transport, requests can overlap freely. See [`crate::wire`].

use async_trait::async_trait;

use kaleido_core::{Connector, ConnectorError, QueryRequest, QueryResponse};

use crate::wire::{WireRequest, WireResponse};

/// A [`Connector`] posting the wire envelope to an HTTP endpoint.
pub struct HttpConnector {
    client: reqwest::Client,
    url: String,
}

impl HttpConnector {
    /// Creates a connector posting to `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Creates a connector with a preconfigured HTTP client (timeouts,
    /// headers, TLS).
    #[must_use]
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, ConnectorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WireRequest::from(&request))
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConnectorError::Transport(format!(
                "backend returned HTTP {}",
                response.status()
            )));
        }
        let envelope: WireResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        envelope.into_response(request.kind)
    }
}
