//! Session identity, initialization state and protocol-version pinning.
//!
//! A transport serves exactly one session. The session moves
//! `Unstarted -> Initializing -> Initialized` and becomes `Closed` when the
//! transport is closed. The only step back is a failed initialize, which
//! returns the session to `Unstarted` without an id.
//!
//! When the transport is built without a session-id generator it runs in
//! *sessionless* mode: no `Mcp-Session-Id` is issued or checked, and requests
//! are accepted before (or without) an initialize handshake.

use http::{HeaderMap, StatusCode};

use super::SessionIdGenerator;
use crate::{
    model::{ErrorData, ProtocolVersion},
    transport::common::{
        http_header::{HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID},
        server_side_http::SessionId,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unstarted,
    Initializing,
    Initialized,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Server already initialized")]
    AlreadyInitialized,
    #[error("Only one initialization request is allowed")]
    InitializeNotAlone,
    #[error("Server not initialized")]
    NotInitialized,
    #[error("Mcp-Session-Id header is required")]
    SessionHeaderRequired,
    #[error("Mcp-Session-Id header must be a single value")]
    SessionHeaderNotSingle,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Session closed")]
    Closed,
    #[error("Generated session id {0:?} is not visible ASCII")]
    InvalidSessionId(String),
    #[error("MCP-Protocol-Version header is required for protocol version {0}")]
    VersionHeaderRequired(ProtocolVersion),
    #[error("Unsupported protocol version: {received} (supported versions: {supported})")]
    VersionUnsupported { received: String, supported: String },
    #[error("MCP-Protocol-Version mismatch: expected {expected}, received {received}")]
    VersionMismatch {
        expected: ProtocolVersion,
        received: ProtocolVersion,
    },
}

impl SessionError {
    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::SessionNotFound | SessionError::Closed => StatusCode::NOT_FOUND,
            SessionError::InvalidSessionId(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn to_error_data(&self) -> ErrorData {
        match self {
            SessionError::AlreadyInitialized | SessionError::InitializeNotAlone => {
                ErrorData::invalid_request(format!("Invalid Request: {self}"), None)
            }
            SessionError::SessionNotFound | SessionError::Closed => {
                ErrorData::session_not_found(self.to_string())
            }
            SessionError::InvalidSessionId(_) => ErrorData::internal_error(self.to_string(), None),
            _ => ErrorData::transport(format!("Bad Request: {self}")),
        }
    }
}

pub struct SessionState {
    generator: Option<SessionIdGenerator>,
    id: Option<SessionId>,
    phase: SessionPhase,
    version: Option<ProtocolVersion>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("stateful", &self.is_stateful())
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("version", &self.version)
            .finish()
    }
}

fn is_visible_ascii(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| (0x21..=0x7e).contains(&b))
}

impl SessionState {
    pub fn new(generator: Option<SessionIdGenerator>) -> Self {
        Self {
            generator,
            id: None,
            phase: SessionPhase::Unstarted,
            version: None,
        }
    }

    pub fn is_stateful(&self) -> bool {
        self.generator.is_some()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn negotiated_version(&self) -> Option<&ProtocolVersion> {
        self.version.as_ref()
    }

    /// Pin the protocol version and, in stateful mode, mint the session id.
    ///
    /// Sessionless transports accept repeated initialization; each one re-pins
    /// the version.
    pub fn begin_initialization(
        &mut self,
        requested: Option<&str>,
    ) -> Result<ProtocolVersion, SessionError> {
        self.check_can_initialize()?;
        let id = match &self.generator {
            Some(generator) => {
                let id = generator();
                if !is_visible_ascii(&id) {
                    return Err(SessionError::InvalidSessionId(id.to_string()));
                }
                Some(id)
            }
            None => None,
        };
        let version = ProtocolVersion::negotiate(requested);
        self.id = id;
        self.version = Some(version.clone());
        self.phase = SessionPhase::Initializing;
        Ok(version)
    }

    pub fn check_can_initialize(&self) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Closed => Err(SessionError::Closed),
            SessionPhase::Unstarted => Ok(()),
            _ if self.is_stateful() => Err(SessionError::AlreadyInitialized),
            _ => Ok(()),
        }
    }

    /// Mark the initialize request as handled.
    pub fn finish_initialization(&mut self) {
        if self.phase == SessionPhase::Initializing {
            self.phase = SessionPhase::Initialized;
        }
    }

    /// Undo [`begin_initialization`](Self::begin_initialization) after the
    /// initialize request failed, so a later initialize can start over.
    pub fn abort_initialization(&mut self) {
        if self.phase == SessionPhase::Initializing {
            self.phase = SessionPhase::Unstarted;
            self.id = None;
            self.version = None;
        }
    }

    /// Returns `true` on the first call only.
    pub fn close(&mut self) -> bool {
        let first = self.phase != SessionPhase::Closed;
        self.phase = SessionPhase::Closed;
        first
    }

    /// Session checks for every request other than initialize.
    pub fn validate(&self, headers: &HeaderMap) -> Result<(), SessionError> {
        if self.phase == SessionPhase::Closed {
            return Err(SessionError::Closed);
        }
        if !self.is_stateful() {
            return Ok(());
        }
        if self.phase != SessionPhase::Initialized {
            return Err(SessionError::NotInitialized);
        }
        self.check_session_header(headers)
    }

    /// Compare the `Mcp-Session-Id` header against the pinned id, ignoring
    /// the session phase.
    pub fn check_session_header(&self, headers: &HeaderMap) -> Result<(), SessionError> {
        if !self.is_stateful() {
            return Ok(());
        }
        let mut values = headers.get_all(HEADER_SESSION_ID).iter();
        let Some(value) = values.next() else {
            return Err(SessionError::SessionHeaderRequired);
        };
        if values.next().is_some() {
            return Err(SessionError::SessionHeaderNotSingle);
        }
        // case-sensitive, byte-exact comparison
        match (&self.id, value.to_str()) {
            (Some(id), Ok(received)) if id.as_ref() == received => Ok(()),
            _ => Err(SessionError::SessionNotFound),
        }
    }

    /// `MCP-Protocol-Version` checks for every request other than initialize.
    pub fn validate_version(&self, headers: &HeaderMap) -> Result<(), SessionError> {
        let Some(value) = headers.get(HEADER_PROTOCOL_VERSION) else {
            return match &self.version {
                Some(pinned) if !pinned.is_default() => {
                    Err(SessionError::VersionHeaderRequired(pinned.clone()))
                }
                _ => Ok(()),
            };
        };
        let received = String::from_utf8_lossy(value.as_bytes());
        let Some(received) = ProtocolVersion::supported(received.trim()) else {
            return Err(SessionError::VersionUnsupported {
                received: received.into_owned(),
                supported: ProtocolVersion::supported_list(),
            });
        };
        match &self.version {
            Some(pinned) if *pinned != received => Err(SessionError::VersionMismatch {
                expected: pinned.clone(),
                received,
            }),
            _ => Ok(()),
        }
    }
}
