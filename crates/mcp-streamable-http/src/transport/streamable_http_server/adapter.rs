//! The HTTP layer of the transport: method dispatch, content negotiation,
//! session/version preconditions, body limits, and CORS.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header, request::Parts};
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::sync::{mpsc::unbounded_channel, oneshot};

use super::{
    StreamableHttpServerTransport,
    registry::{RegistryError, Resumed, StreamHandle, StreamSink},
    router::{InboundBatch, classify},
    session::{SessionError, SessionPhase},
};
use crate::{
    error::{BoxError, TransportError},
    handler::{MessageHandler, RequestInfo},
    model::{ErrorData, JsonRpcMessage},
    transport::common::{
        http_header::{EVENT_STREAM_MIME_TYPE, JSON_MIME_TYPE, LAST_EVENT_ID, SESSION_ID},
        server_side_http::{
            BoxResponse, SessionId, empty_response, error_response, json_response, sse_body,
            sse_response,
        },
    },
};

pub const ALLOWED_METHODS: &str = "GET, POST, DELETE, OPTIONS";

/// An HTTP-level refusal, answered with the shared error envelope.
#[derive(Debug, Clone)]
pub(crate) struct Rejection {
    pub(crate) status: StatusCode,
    pub(crate) error: ErrorData,
}

impl Rejection {
    pub(crate) fn new(status: StatusCode, error: ErrorData) -> Self {
        Self { status, error }
    }

    pub(crate) fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorData::transport("Method Not Allowed"),
        )
    }

    pub(crate) fn into_response(self) -> BoxResponse {
        let status = self.status;
        let mut response = error_response(status, self.error);
        if status == StatusCode::METHOD_NOT_ALLOWED {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
        }
        response
    }
}

impl From<SessionError> for Rejection {
    fn from(error: SessionError) -> Self {
        Self::new(error.status(), error.to_error_data())
    }
}

impl From<RegistryError> for Rejection {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::Conflict => Self::new(
                StatusCode::CONFLICT,
                ErrorData::transport(format!("Conflict: {error}")),
            ),
            RegistryError::DuplicatedRequestId(_) => Self::new(
                StatusCode::BAD_REQUEST,
                ErrorData::invalid_request(format!("Invalid Request: {error}"), None),
            ),
        }
    }
}

impl From<TransportError> for Rejection {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Session(error) => error.into(),
            TransportError::Registry(error) => error.into(),
            error => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorData::internal_error(format!("Internal error: {error}"), None),
            ),
        }
    }
}

fn accepts(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(mime))
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(JSON_MIME_TYPE))
}

fn with_session_header(mut response: BoxResponse, session_id: Option<&SessionId>) -> BoxResponse {
    if let Some(session_id) = session_id {
        match HeaderValue::from_str(session_id) {
            Ok(value) => {
                response.headers_mut().insert(SESSION_ID, value);
            }
            Err(error) => tracing::error!(%error, %session_id, "session id is not a valid header value"),
        }
    }
    response
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, Rejection>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(error) if error.is::<LengthLimitError>() => Err(Rejection::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorData::transport(format!("Payload Too Large: body exceeds {limit} bytes")),
        )),
        Err(error) => Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            ErrorData::parse_error(format!("Parse error: failed to read body: {error}"), None),
        )),
    }
}

impl StreamableHttpServerTransport {
    /// Serve one HTTP request against this session.
    ///
    /// Never fails: every problem is answered with a JSON-RPC error envelope
    /// at the matching status. CORS headers are attached to every response.
    pub async fn handle_request<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let preflight = request.method() == Method::OPTIONS;
        let mut response = match self.route_request(request).await {
            Ok(response) => response,
            Err(rejection) => {
                tracing::warn!(
                    status = %rejection.status,
                    error = %rejection.error.message,
                    "request rejected"
                );
                rejection.into_response()
            }
        };
        self.inner
            .config
            .cors
            .apply(response.headers_mut(), preflight);
        response
    }

    async fn route_request<B>(&self, request: Request<B>) -> Result<BoxResponse, Rejection>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();
        if parts.method == Method::OPTIONS {
            return Ok(empty_response(StatusCode::OK));
        }
        if let Some(validation) = &self.inner.config.host_validation {
            validation
                .check(&parts.headers)
                .map_err(|error| Rejection::new(StatusCode::FORBIDDEN, error))?;
        }
        let method = parts.method.clone();
        match method {
            Method::GET => self.handle_get(parts).await,
            Method::POST => self.handle_post(parts, body).await,
            Method::DELETE => self.handle_delete(parts).await,
            _ => Err(Rejection::method_not_allowed()),
        }
    }

    async fn handle_get(&self, parts: Parts) -> Result<BoxResponse, Rejection> {
        if !accepts(&parts.headers, EVENT_STREAM_MIME_TYPE) {
            return Err(Rejection::new(
                StatusCode::NOT_ACCEPTABLE,
                ErrorData::transport("Not Acceptable: Client must accept text/event-stream"),
            ));
        }
        let mut state = self.inner.state.lock().await;
        state.session.validate(&parts.headers)?;
        state.session.validate_version(&parts.headers)?;
        let session_id = state.session.session_id().cloned();

        let (tx, rx) = unbounded_channel();
        let last_event_id = parts
            .headers
            .get(LAST_EVENT_ID)
            .and_then(|value| value.to_str().ok());
        let resumed = match (last_event_id, &self.inner.config.event_store) {
            (Some(last_event_id), Some(store)) => {
                let replay = store
                    .replay_events_after(last_event_id)
                    .await
                    .map_err(TransportError::EventStore)?;
                let Some(replay) = replay else {
                    return Err(Rejection::new(
                        StatusCode::BAD_REQUEST,
                        ErrorData::transport(format!(
                            "Bad Request: unknown Last-Event-ID {last_event_id}"
                        )),
                    ));
                };
                tracing::debug!(
                    stream_id = %replay.stream_id,
                    count = replay.events.len(),
                    %last_event_id,
                    "resuming sse stream"
                );
                // replayed events go out before anything sent after the resume
                for event in replay.events {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                state.registry.resume_stream(replay.stream_id, tx)?
            }
            _ => Resumed::Attached(state.registry.open_standalone_stream(tx)?),
        };
        drop(state);

        let keep_alive = self.inner.config.sse_keep_alive;
        let body = match resumed {
            Resumed::Attached(handle) => {
                tracing::debug!(stream_id = %handle.id, "sse stream opened");
                sse_body(rx, keep_alive, self.stream_guard(handle))
            }
            Resumed::Finished => {
                tracing::debug!("stream has nothing left in flight, replay only");
                sse_body(rx, keep_alive, ())
            }
        };
        Ok(with_session_header(sse_response(body), session_id.as_ref()))
    }

    async fn handle_post<B>(&self, parts: Parts, body: B) -> Result<BoxResponse, Rejection>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let headers = &parts.headers;
        if !(accepts(headers, JSON_MIME_TYPE) && accepts(headers, EVENT_STREAM_MIME_TYPE)) {
            return Err(Rejection::new(
                StatusCode::NOT_ACCEPTABLE,
                ErrorData::transport(
                    "Not Acceptable: Client must accept both application/json and text/event-stream",
                ),
            ));
        }
        if !has_json_content_type(headers) {
            return Err(Rejection::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ErrorData::transport("Unsupported Media Type: Content-Type must be application/json"),
            ));
        }
        let body = read_body(body, self.inner.config.max_body_bytes).await?;
        let batch = classify(&body).map_err(|error| Rejection::new(StatusCode::BAD_REQUEST, error))?;
        let info = RequestInfo::from_parts(&parts);
        let initializing = batch.has_initialize();

        let mut state = self.inner.state.lock().await;
        let handler = state.handler.clone().ok_or(TransportError::NotStarted)?;
        if initializing {
            state.session.check_can_initialize()?;
            if batch.len() > 1 {
                return Err(SessionError::InitializeNotAlone.into());
            }
            let requested = batch
                .initialize_request()
                .and_then(JsonRpcMessage::requested_protocol_version);
            let version = state.session.begin_initialization(requested)?;
            tracing::info!(session_id = ?state.session.session_id(), %version, "session initializing");
        } else {
            state.session.validate(headers)?;
            state.session.validate_version(headers)?;
        }
        let session_id = state.session.session_id().cloned();

        if !batch.has_requests() {
            drop(state);
            self.dispatch(&handler, batch, &info).await?;
            return Ok(with_session_header(
                empty_response(StatusCode::ACCEPTED),
                session_id.as_ref(),
            ));
        }

        let request_ids = batch.request_ids();
        let single = request_ids.len() == 1;
        if self.inner.config.json_response {
            let (tx, rx) = oneshot::channel();
            let handle = state
                .registry
                .open_response_stream(request_ids, StreamSink::Json(tx))?;
            drop(state);
            let guard = self.stream_guard(handle.clone());
            self.dispatch_inline(&handler, batch, &info, &handle, initializing)
                .await?;
            let responses = rx.await.map_err(|_| {
                Rejection::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorData::transport("Transport closed before all responses were collected"),
                )
            })?;
            drop(guard);
            let body = match responses.as_slice() {
                [response] if single => serde_json::to_vec(response),
                responses => serde_json::to_vec(responses),
            }
            .map_err(TransportError::from)?;
            Ok(with_session_header(
                json_response(StatusCode::OK, body.into()),
                session_id.as_ref(),
            ))
        } else {
            let (tx, rx) = unbounded_channel();
            let handle = state
                .registry
                .open_response_stream(request_ids, StreamSink::Sse(tx))?;
            drop(state);
            tracing::debug!(stream_id = %handle.id, "response stream opened");
            let guard = self.stream_guard(handle.clone());
            if initializing {
                // the session id is only handed out once initialize succeeded
                self.dispatch_inline(&handler, batch, &info, &handle, true)
                    .await?;
            } else {
                let transport = self.clone();
                tokio::spawn(async move {
                    transport.dispatch_streaming(&handler, batch, &info).await;
                });
            }
            let body = sse_body(rx, self.inner.config.sse_keep_alive, guard);
            Ok(with_session_header(sse_response(body), session_id.as_ref()))
        }
    }

    async fn handle_delete(&self, parts: Parts) -> Result<BoxResponse, Rejection> {
        {
            let state = self.inner.state.lock().await;
            if state.session.phase() == SessionPhase::Closed {
                // a repeated DELETE for the same session is not an error
                state.session.check_session_header(&parts.headers)?;
                return Ok(empty_response(StatusCode::OK));
            }
            state.session.validate(&parts.headers)?;
            state.session.validate_version(&parts.headers)?;
        }
        self.close().await;
        Ok(empty_response(StatusCode::OK))
    }

    /// Hand every message to the handler, in array order.
    async fn dispatch(
        &self,
        handler: &Arc<dyn MessageHandler>,
        batch: InboundBatch,
        info: &RequestInfo,
    ) -> Result<(), Rejection> {
        for message in batch {
            tracing::debug!(?message, "dispatching inbound message");
            if let Err(error) = handler.on_message(message, info.clone(), self.clone()).await {
                let error = TransportError::Handler(error);
                tracing::error!(%error, "handler failed");
                return Err(Rejection::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorData::internal_error(error.to_string(), None),
                ));
            }
        }
        Ok(())
    }

    /// Dispatch before the response is returned. On failure the stream is
    /// dropped with its ids, and a failed initialize leaves the session
    /// unstarted.
    async fn dispatch_inline(
        &self,
        handler: &Arc<dyn MessageHandler>,
        batch: InboundBatch,
        info: &RequestInfo,
        handle: &StreamHandle,
        initializing: bool,
    ) -> Result<(), Rejection> {
        let result = self.dispatch(handler, batch, info).await;
        let mut state = self.inner.state.lock().await;
        match result {
            Ok(()) if initializing => {
                state.session.finish_initialization();
                tracing::info!(session_id = ?state.session.session_id(), "session initialized");
            }
            Ok(()) => {}
            Err(_) => {
                state.registry.complete_stream(&handle.id);
                if initializing {
                    state.session.abort_initialization();
                    tracing::warn!("initialize failed, session not started");
                }
            }
        }
        result
    }

    /// Dispatch behind an open SSE response. A failing request is answered
    /// with an internal error event and the rest of the batch still runs.
    async fn dispatch_streaming(
        &self,
        handler: &Arc<dyn MessageHandler>,
        batch: InboundBatch,
        info: &RequestInfo,
    ) {
        for message in batch {
            tracing::debug!(?message, "dispatching inbound message");
            let request_id = message.request_id().cloned();
            let Err(error) = handler.on_message(message, info.clone(), self.clone()).await else {
                continue;
            };
            let error = TransportError::Handler(error);
            tracing::error!(%error, "handler failed");
            let Some(request_id) = request_id else {
                continue;
            };
            let still_owed = self
                .inner
                .state
                .lock()
                .await
                .registry
                .stream_for_request(&request_id)
                .is_some();
            if still_owed {
                let reply = JsonRpcMessage::error(
                    Some(request_id),
                    ErrorData::internal_error(error.to_string(), None),
                );
                if let Err(error) = self.send(reply).await {
                    tracing::debug!(%error, "error reply not delivered");
                }
            }
        }
    }
}
