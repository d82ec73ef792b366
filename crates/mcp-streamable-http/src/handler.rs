//! The contract between the transport and the agent it serves.
//!
//! A [`MessageHandler`] receives every inbound JSON-RPC message together with
//! the HTTP context it arrived in. Replies are not returned from
//! [`MessageHandler::on_message`]; the handler pushes them back through
//! [`StreamableHttpServerTransport::send`], either before returning or later
//! from a spawned task. The transport works out which HTTP stream each reply
//! belongs to.

use http::{HeaderMap, Method, Uri, request::Parts};

use crate::{
    error::{BoxError, TransportError},
    model::JsonRpcMessage,
    transport::StreamableHttpServerTransport,
};

/// HTTP context of the call that carried a message.
///
/// `extensions` is copied from the incoming request untouched, so
/// authentication data inserted by host middleware reaches the handler.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub extensions: http::Extensions,
}

impl RequestInfo {
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            extensions: parts.extensions.clone(),
        }
    }
}

#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once per inbound message, in batch order. An `Err` becomes a
    /// -32603 internal error: a `500` while the response has not started,
    /// otherwise an error event for the request on its SSE stream.
    async fn on_message(
        &self,
        message: JsonRpcMessage,
        info: RequestInfo,
        transport: StreamableHttpServerTransport,
    ) -> Result<(), BoxError>;

    /// Routing faults the transport cannot answer over HTTP.
    fn on_error(&self, error: &TransportError) {
        tracing::error!(%error, "streamable http transport error");
    }

    /// Called exactly once, when the transport closes.
    fn on_close(&self) {}
}
