use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{StreamExt, future::BoxFuture};
use http::{HeaderValue, Method, Request, StatusCode, header};
use http_body::Body;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use tokio::sync::RwLock;

use super::{StreamableHttpServerConfig, StreamableHttpServerTransport, adapter::Rejection};
use crate::{
    error::BoxError,
    handler::MessageHandler,
    model::ErrorData,
    transport::common::{
        http_header::HEADER_SESSION_ID,
        server_side_http::{BoxResponse, SessionId, empty_response},
    },
};

type SessionMap = Arc<RwLock<HashMap<SessionId, StreamableHttpServerTransport>>>;

/// Hosts many sessions behind one endpoint.
///
/// Every POST without `Mcp-Session-Id` gets a fresh transport and a fresh
/// handler from `handler_factory`; the transport is kept only if the request
/// established a session. Later requests are routed by their session header,
/// and a session is forgotten as soon as its transport closes.
///
/// With a stateless config each POST is served by a throwaway transport that
/// is closed once its response body is finished or dropped.
pub struct StreamableHttpService<H> {
    pub config: StreamableHttpServerConfig,
    sessions: SessionMap,
    handler_factory: Arc<dyn Fn() -> Result<H, std::io::Error> + Send + Sync>,
}

impl<H> Clone for StreamableHttpService<H> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            handler_factory: self.handler_factory.clone(),
        }
    }
}

impl<H> std::fmt::Debug for StreamableHttpService<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Closes a stateless transport when its response body goes away.
struct CloseOnDrop(StreamableHttpServerTransport);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let transport = self.0.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { transport.close().await });
        }
    }
}

impl<H: MessageHandler> StreamableHttpService<H> {
    pub fn new(
        handler_factory: impl Fn() -> Result<H, std::io::Error> + Send + Sync + 'static,
        config: StreamableHttpServerConfig,
    ) -> Self {
        Self {
            config,
            sessions: Default::default(),
            handler_factory: Arc::new(handler_factory),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn handle<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let preflight = request.method() == Method::OPTIONS;
        let result = if preflight {
            Ok(empty_response(StatusCode::OK))
        } else if let Some(Err(error)) = self
            .config
            .host_validation
            .as_ref()
            .map(|validation| validation.check(request.headers()))
        {
            Err(Rejection::new(StatusCode::FORBIDDEN, error))
        } else if self.config.is_stateful() {
            self.handle_stateful(request).await
        } else {
            self.handle_stateless(request).await
        };
        let mut response = result.unwrap_or_else(|rejection| {
            tracing::warn!(
                status = %rejection.status,
                error = %rejection.error.message,
                "request rejected"
            );
            rejection.into_response()
        });
        self.config.cors.apply(response.headers_mut(), preflight);
        response
    }

    fn new_transport(&self) -> Result<(StreamableHttpServerTransport, Arc<H>), Rejection> {
        let handler = (self.handler_factory)().map_err(|error| {
            tracing::error!(%error, "failed to create handler");
            Rejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorData::internal_error(format!("Failed to create handler: {error}"), None),
            )
        })?;
        let transport = StreamableHttpServerTransport::new(self.config.clone());
        Ok((transport, Arc::new(handler)))
    }

    async fn handle_stateful<B>(&self, request: Request<B>) -> Result<BoxResponse, Rejection>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let session_id = request
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|value| value.to_str().ok())
            .map(SessionId::from);
        if let Some(session_id) = session_id {
            let transport = self.sessions.read().await.get(&session_id).cloned();
            let Some(transport) = transport else {
                tracing::debug!(%session_id, "unknown session");
                return Err(Rejection::new(
                    StatusCode::NOT_FOUND,
                    ErrorData::session_not_found("Session not found"),
                ));
            };
            return Ok(transport.handle_request(request).await);
        }
        if request.method() != Method::POST {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                ErrorData::transport("Bad Request: Mcp-Session-Id header is required"),
            ));
        }

        let (transport, handler) = self.new_transport()?;
        transport.start(handler).await?;
        let response = transport.handle_request(request).await;
        match transport.initialized_session_id().await {
            Some(session_id) if !transport.is_closed() => {
                tracing::info!(%session_id, "session created");
                self.sessions
                    .write()
                    .await
                    .insert(session_id.clone(), transport.clone());
                let sessions = self.sessions.clone();
                tokio::spawn(async move {
                    transport.closed().await;
                    sessions.write().await.remove(&session_id);
                    tracing::info!(%session_id, "session removed");
                });
            }
            // the POST did not establish a session, or initialize failed
            _ => transport.close().await,
        }
        Ok(response)
    }

    async fn handle_stateless<B>(&self, request: Request<B>) -> Result<BoxResponse, Rejection>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        if request.method() != Method::POST {
            let mut rejection = Rejection::method_not_allowed();
            rejection.error.message = "Method Not Allowed: stateless server only accepts POST".into();
            let mut response = rejection.into_response();
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST, OPTIONS"));
            return Ok(response);
        }
        let (transport, handler) = self.new_transport()?;
        transport.start(handler).await?;
        let response = transport.handle_request(request).await;
        let (parts, body) = response.into_parts();
        let guard = CloseOnDrop(transport);
        let frames = BodyStream::new(body).map(move |frame| {
            let _guard = &guard;
            frame
        });
        Ok(http::Response::from_parts(
            parts,
            StreamBody::new(frames).boxed_unsync(),
        ))
    }
}

impl<B, H> tower_service::Service<Request<B>> for StreamableHttpService<H>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    H: MessageHandler,
{
    type Response = BoxResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(request).await) })
    }
}
