use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    StreamableHttpServerConfig,
    registry::{ResponseRoute, STANDALONE_STREAM_ID, StreamHandle, StreamId, StreamRegistry},
    router::{OutboundChannel, resolve_outbound_channel},
    event_store::EventId,
    session::{SessionPhase, SessionState},
};
use crate::{
    error::TransportError,
    handler::MessageHandler,
    model::{JsonRpcMessage, ProtocolVersion, RequestId},
    transport::common::server_side_http::{ServerSseMessage, SessionId},
};

pub(crate) struct TransportState {
    pub(crate) session: SessionState,
    pub(crate) registry: StreamRegistry,
    pub(crate) handler: Option<Arc<dyn MessageHandler>>,
}

pub(crate) struct TransportInner {
    pub(crate) config: StreamableHttpServerConfig,
    pub(crate) state: Mutex<TransportState>,
    pub(crate) ct: CancellationToken,
}

/// Server side of one streamable HTTP session.
///
/// Cloning is cheap; every clone drives the same session. HTTP requests go in
/// through [`handle_request`](Self::handle_request), handler output goes out
/// through [`send`](Self::send).
#[derive(Clone)]
pub struct StreamableHttpServerTransport {
    pub(crate) inner: Arc<TransportInner>,
}

impl std::fmt::Debug for StreamableHttpServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerTransport")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamableHttpServerTransport {
    pub fn new(config: StreamableHttpServerConfig) -> Self {
        let session = SessionState::new(config.session_id_generator.clone());
        Self {
            inner: Arc::new(TransportInner {
                config,
                state: Mutex::new(TransportState {
                    session,
                    registry: StreamRegistry::new(),
                    handler: None,
                }),
                ct: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &StreamableHttpServerConfig {
        &self.inner.config
    }

    /// Attach the handler. Requests that arrive before this are answered with
    /// an internal error.
    pub async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        if state.handler.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        state.handler = Some(handler);
        Ok(())
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.state.lock().await.session.session_id().cloned()
    }

    /// The session id, once the initialize handshake has gone through.
    pub async fn initialized_session_id(&self) -> Option<SessionId> {
        let state = self.inner.state.lock().await;
        match state.session.phase() {
            SessionPhase::Initialized => state.session.session_id().cloned(),
            _ => None,
        }
    }

    pub async fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.inner
            .state
            .lock()
            .await
            .session
            .negotiated_version()
            .cloned()
    }

    /// Route an outbound message.
    ///
    /// Responses and errors go to the stream waiting on their id. Requests and
    /// notifications go to the standalone GET stream, or nowhere if no client
    /// is listening.
    pub async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.route(message, None).await
    }

    /// Like [`send`](Self::send), but a request or notification is written to
    /// the SSE stream of the POST that carried `related_request_id`. Falls back
    /// to the standalone stream once that POST stream is gone.
    pub async fn send_related(
        &self,
        message: JsonRpcMessage,
        related_request_id: RequestId,
    ) -> Result<(), TransportError> {
        self.route(message, Some(&related_request_id)).await
    }

    async fn route(
        &self,
        message: JsonRpcMessage,
        related: Option<&RequestId>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            tracing::debug!(?message, "transport closed, outbound message dropped");
            return Ok(());
        }
        match resolve_outbound_channel(&message, related) {
            OutboundChannel::RequestWise(request_id) => {
                self.send_response(request_id, message).await
            }
            OutboundChannel::Related(request_id) => {
                self.send_related_message(request_id, message).await
            }
            OutboundChannel::Standalone => {
                let state = self.inner.state.lock().await;
                self.send_standalone(&state, message).await;
                Ok(())
            }
        }
    }

    async fn send_response(
        &self,
        request_id: RequestId,
        message: JsonRpcMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        match state.registry.resolve_response(&request_id) {
            ResponseRoute::Stream(stream_id) => {
                if state.registry.is_sse(&stream_id) {
                    let event = self.make_event(&stream_id, message.clone()).await;
                    if !state.registry.write(&stream_id, event) {
                        tracing::debug!(%stream_id, ?request_id, "sse receiver gone, response not written");
                    }
                }
                if state.registry.record_response(&request_id, message) {
                    tracing::debug!(%stream_id, "all responses collected, completing stream");
                    state.registry.complete_stream(&stream_id);
                }
                Ok(())
            }
            ResponseRoute::Detached {
                stream_id,
                resumable,
            } => {
                if resumable {
                    // kept for a client that resumes the stream
                    self.store_event(&stream_id, &message).await;
                    tracing::debug!(%stream_id, ?request_id, "client disconnected, response stored for resumption");
                } else {
                    tracing::debug!(%stream_id, ?request_id, "client disconnected, response dropped");
                }
                state.registry.record_response(&request_id, message);
                Ok(())
            }
            ResponseRoute::Unknown => {
                let handler = state.handler.clone();
                drop(state);
                let error = TransportError::NoStreamForRequest(request_id);
                tracing::error!(%error, "response for a request that is not in flight");
                if let Some(handler) = handler {
                    handler.on_error(&error);
                }
                Err(error)
            }
        }
    }

    async fn send_related_message(
        &self,
        request_id: RequestId,
        message: JsonRpcMessage,
    ) -> Result<(), TransportError> {
        let state = self.inner.state.lock().await;
        match state.registry.stream_for_request(&request_id).cloned() {
            Some(stream_id) if state.registry.is_sse(&stream_id) => {
                let event = self.make_event(&stream_id, message).await;
                if !state.registry.write(&stream_id, event) {
                    tracing::debug!(%stream_id, "sse receiver gone, related message dropped");
                }
            }
            Some(stream_id) if state.registry.is_resumable_detached(&stream_id) => {
                self.store_event(&stream_id, &message).await;
                tracing::debug!(%stream_id, "client disconnected, related message stored for resumption");
            }
            Some(stream_id) => {
                tracing::debug!(%stream_id, "stream cannot carry related messages, dropped");
            }
            None => self.send_standalone(&state, message).await,
        }
        Ok(())
    }

    async fn send_standalone(&self, state: &TransportState, message: JsonRpcMessage) {
        if !state.registry.has_standalone_stream() {
            tracing::debug!(?message, "no standalone stream open, message dropped");
            return;
        }
        let stream_id: StreamId = STANDALONE_STREAM_ID.into();
        let event = self.make_event(&stream_id, message).await;
        if !state.registry.write(&stream_id, event) {
            tracing::debug!("standalone sse receiver gone, message dropped");
        }
    }

    /// Store the message when resumability is on. A store failure only
    /// costs the event its id.
    async fn store_event(&self, stream_id: &StreamId, message: &JsonRpcMessage) -> Option<EventId> {
        let store = self.inner.config.event_store.as_ref()?;
        match store.store_event(stream_id, message).await {
            Ok(event_id) => Some(event_id),
            Err(error) => {
                let error = TransportError::EventStore(error);
                tracing::error!(%error, %stream_id, "failed to store event");
                None
            }
        }
    }

    async fn make_event(&self, stream_id: &StreamId, message: JsonRpcMessage) -> ServerSseMessage {
        ServerSseMessage {
            event_id: self.store_event(stream_id, &message).await,
            message: Arc::new(message),
        }
    }

    /// Tear down every stream and end the session. Idempotent.
    pub async fn close(&self) {
        let handler = {
            let mut state = self.inner.state.lock().await;
            if !state.session.close() {
                return;
            }
            state.registry.close_all();
            state.handler.clone()
        };
        self.inner.ct.cancel();
        tracing::info!("streamable http transport closed");
        if let Some(handler) = handler {
            handler.on_close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.ct.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has run.
    pub async fn closed(&self) {
        self.inner.ct.cancelled().await
    }

    pub(crate) fn stream_guard(&self, handle: StreamHandle) -> StreamGuard {
        StreamGuard {
            transport: Arc::downgrade(&self.inner),
            handle,
        }
    }
}

/// Releases a stream from the registry when the HTTP response that owns it is
/// dropped, e.g. because the client disconnected.
pub(crate) struct StreamGuard {
    transport: Weak<TransportInner>,
    handle: StreamHandle,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let Some(inner) = self.transport.upgrade() else {
            return;
        };
        let handle = self.handle.clone();
        let resumable = inner.config.event_store.is_some();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if inner.state.lock().await.registry.release(&handle, resumable) {
                        tracing::debug!(stream_id = %handle.id, "stream released after disconnect");
                    }
                });
            }
            Err(_) => {
                if let Ok(mut state) = inner.state.try_lock() {
                    state.registry.release(&handle, resumable);
                }
            }
        }
    }
}
