//! # Kaleido Connectors
//!
//! Transport adapters satisfying the `kaleido-core` [`Connector`] contract.
//! Three interchangeable implementations:
//!
//! - [`EmbeddedConnector`]: an in-process DataFusion engine
//! - [`SocketConnector`]: newline-delimited JSON envelope over TCP
//! - [`HttpConnector`]: the same envelope over HTTP POST
//!
//! Columnar results travel as base64 Arrow IPC streams inside the JSON
//! envelope ([`wire`]); the core never sees the transport.
//!
//! [`Connector`]: kaleido_core::Connector

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod embedded;
pub mod http;
pub mod socket;
pub mod wire;

pub use embedded::EmbeddedConnector;
pub use http::HttpConnector;
pub use socket::SocketConnector;
