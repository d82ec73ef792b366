//! Streamable HTTP Server Transport Module
//!
//! One [`StreamableHttpServerTransport`] serves one MCP session over plain
//! HTTP: clients POST JSON-RPC messages, open a long-lived GET for
//! server-initiated messages, and DELETE to end the session. Replies travel
//! back either as Server-Sent Events or as a single JSON body.
//!
//! # Module Organization
//!
//! - `session` - session identity, initialization and protocol-version pinning
//! - `registry` - SSE/JSON streams and the pending-request ledger
//! - `router` - inbound classification and outbound channel resolution
//! - `server_transport` - the transport itself (`start`, `send`, `close`)
//! - `adapter` - the HTTP method/header layer in front of the transport
//! - `event_store` - optional event storage for `Last-Event-ID` resumption
//! - `tower` - a `tower_service::Service` hosting one transport per session
//!
//! # Examples
//!
//! ```ignore
//! use mcp_streamable_http::transport::streamable_http_server::{
//!     StreamableHttpServerConfig, StreamableHttpService,
//! };
//! let service = StreamableHttpService::new(|| Ok(handler), StreamableHttpServerConfig::default());
//! let router = axum::Router::new().nest_service("/mcp", service);
//! ```

pub mod adapter;
pub mod event_store;
pub mod registry;
pub mod router;
pub mod server_transport;
pub mod session;

#[cfg(feature = "tower")]
#[cfg_attr(docsrs, doc(cfg(feature = "tower")))]
pub mod tower;

use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderValue, Method, header};

pub use self::{
    event_store::{EventStore, InMemoryEventStore},
    server_transport::StreamableHttpServerTransport,
    session::{SessionError, SessionPhase},
};
#[cfg(feature = "tower")]
pub use self::tower::StreamableHttpService;
use crate::{
    model::ErrorData,
    transport::common::{
        http_header::{
            HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID,
        },
        server_side_http::{SessionId, session_id},
    },
};

pub type SessionIdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;

pub const DEFAULT_SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Configuration for the streamable HTTP server
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping message duration for SSE connections.
    pub sse_keep_alive: Option<Duration>,
    /// Mints session ids. `None` runs the transport sessionless.
    pub session_id_generator: Option<SessionIdGenerator>,
    /// Answer POSTs with one JSON body instead of an SSE stream.
    pub json_response: bool,
    /// Stores SSE events so clients can resume with `Last-Event-ID`.
    pub event_store: Option<Arc<dyn EventStore>>,
    pub cors: CorsOptions,
    /// DNS-rebinding protection. `None` accepts any `Host` and `Origin`.
    pub host_validation: Option<HostValidation>,
    /// Upper bound on a POST body.
    pub max_body_bytes: usize,
}

impl std::fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("stateful", &self.is_stateful())
            .field("json_response", &self.json_response)
            .field("event_store", &self.event_store.is_some())
            .field("cors", &self.cors)
            .field("host_validation", &self.host_validation)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(DEFAULT_SSE_KEEP_ALIVE),
            session_id_generator: Some(Arc::new(session_id)),
            json_response: false,
            event_store: None,
            cors: CorsOptions::default(),
            host_validation: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl StreamableHttpServerConfig {
    /// No session ids are issued or checked.
    pub fn stateless() -> Self {
        Self {
            session_id_generator: None,
            ..Default::default()
        }
    }

    pub fn is_stateful(&self) -> bool {
        self.session_id_generator.is_some()
    }

    pub fn with_session_id_generator(
        mut self,
        generator: impl Fn() -> SessionId + Send + Sync + 'static,
    ) -> Self {
        self.session_id_generator = Some(Arc::new(generator));
        self
    }

    pub fn with_json_response(mut self, json_response: bool) -> Self {
        self.json_response = json_response;
        self
    }

    pub fn with_sse_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.sse_keep_alive = keep_alive;
        self
    }

    pub fn with_event_store(mut self, store: impl EventStore) -> Self {
        self.event_store = Some(Arc::new(store));
        self
    }

    pub fn with_cors(mut self, cors: CorsOptions) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_host_validation(mut self, validation: HostValidation) -> Self {
        self.host_validation = Some(validation);
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

/// CORS headers attached to every response.
///
/// Preflight (`OPTIONS`) responses carry the full set; everything else only
/// carries the origin and the exposed headers.
#[derive(Debug, Clone)]
pub struct CorsOptions {
    pub allow_origin: String,
    pub allow_headers: Vec<String>,
    pub allow_methods: Vec<Method>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<Duration>,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_headers: [
                header::CONTENT_TYPE.as_str(),
                header::ACCEPT.as_str(),
                header::AUTHORIZATION.as_str(),
                HEADER_SESSION_ID,
                HEADER_PROTOCOL_VERSION,
                HEADER_LAST_EVENT_ID,
            ]
            .map(String::from)
            .to_vec(),
            allow_methods: vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS],
            expose_headers: vec![
                HEADER_SESSION_ID.to_string(),
                HEADER_PROTOCOL_VERSION.to_string(),
            ],
            max_age: Some(Duration::from_secs(86400)),
        }
    }
}

fn joined_header_value<T: AsRef<str>>(items: &[T]) -> Option<HeaderValue> {
    let joined = items
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ");
    match HeaderValue::from_str(&joined) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(%error, value = %joined, "invalid CORS header value, skipped");
            None
        }
    }
}

impl CorsOptions {
    pub(crate) fn apply(&self, headers: &mut HeaderMap, preflight: bool) {
        match HeaderValue::from_str(&self.allow_origin) {
            Ok(origin) => {
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            }
            Err(error) => tracing::warn!(%error, "invalid CORS origin, skipped"),
        }
        if let Some(expose) = joined_header_value(&self.expose_headers) {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, expose);
        }
        if !preflight {
            return;
        }
        let methods = self
            .allow_methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>();
        if let Some(methods) = joined_header_value(&methods) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
        }
        if let Some(allow) = joined_header_value(&self.allow_headers) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow);
        }
        if let Some(max_age) = self.max_age {
            headers.insert(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from(max_age.as_secs()),
            );
        }
    }
}

/// Allow-lists for the `Host` and `Origin` headers.
///
/// An empty list disables that check. A missing `Host` fails the host check;
/// a missing `Origin` passes the origin check (non-browser clients).
#[derive(Debug, Clone, Default)]
pub struct HostValidation {
    pub allowed_hosts: Vec<String>,
    pub allowed_origins: Vec<String>,
}

impl HostValidation {
    pub fn new(
        allowed_hosts: impl IntoIterator<Item = impl Into<String>>,
        allowed_origins: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            allowed_hosts: allowed_hosts.into_iter().map(Into::into).collect(),
            allowed_origins: allowed_origins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), ErrorData> {
        if !self.allowed_hosts.is_empty() {
            let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
            match host {
                Some(host) if self.allowed_hosts.iter().any(|allowed| allowed == host) => {}
                Some(host) => {
                    return Err(ErrorData::transport(format!("Invalid Host header: {host}")));
                }
                None => return Err(ErrorData::transport("Invalid Host header: missing")),
            }
        }
        if !self.allowed_origins.is_empty() {
            if let Some(origin) = headers.get(header::ORIGIN) {
                let origin = origin.to_str().unwrap_or_default();
                if !self.allowed_origins.iter().any(|allowed| allowed == origin) {
                    return Err(ErrorData::transport(format!(
                        "Invalid Origin header: {origin}"
                    )));
                }
            }
        }
        Ok(())
    }
}
