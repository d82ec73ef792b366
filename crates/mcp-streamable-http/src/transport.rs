//! HTTP transports.
//!
//! | role | transport | module |
//! |------|-----------|--------|
//! | server | streamable HTTP (POST/GET/DELETE + SSE) | [`streamable_http_server`] |
//!
//! A [`StreamableHttpServerTransport`] serves a single session. Hosts that
//! serve many sessions behind one route use
//! [`StreamableHttpService`](streamable_http_server::StreamableHttpService)
//! (feature `tower`).

pub mod common;
pub mod streamable_http_server;

pub use streamable_http_server::{StreamableHttpServerConfig, StreamableHttpServerTransport};
#[cfg(feature = "tower")]
pub use streamable_http_server::StreamableHttpService;
