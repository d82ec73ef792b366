#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::{BoxError, ErrorData, TransportError};

/// JSON-RPC 2.0 messages and protocol versions
pub mod model;

pub mod handler;
pub use handler::{MessageHandler, RequestInfo};

pub mod transport;
pub use transport::{StreamableHttpServerConfig, StreamableHttpServerTransport};
#[cfg(feature = "tower")]
pub use transport::StreamableHttpService;

// re-export
pub use async_trait::async_trait;
pub use serde_json;
