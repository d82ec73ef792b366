use std::fmt::Display;

pub use crate::model::ErrorData;
use crate::{
    model::RequestId,
    transport::streamable_http_server::{registry::RegistryError, session::SessionError},
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Errors surfaced by the streamable HTTP server transport itself, as opposed
/// to the per-request rejections that are answered with an HTTP status.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Transport already started")]
    AlreadyStarted,
    #[error("Transport not started")]
    NotStarted,
    #[error("No stream registered for request id {0}")]
    NoStreamForRequest(RequestId),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Stream registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Event store error: {0}")]
    EventStore(#[source] BoxError),
    #[error("Handler error: {0}")]
    Handler(#[source] BoxError),
    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}
