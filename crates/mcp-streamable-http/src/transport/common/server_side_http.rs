use std::{convert::Infallible, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::stream;
use http::{HeaderValue, Response, StatusCode, header};
use http_body::Frame;
use http_body_util::{BodyExt, Empty, Full, StreamBody, combinators::UnsyncBoxBody};
use tokio::sync::mpsc::UnboundedReceiver;

use super::http_header::{EVENT_STREAM_MIME_TYPE, JSON_MIME_TYPE, X_ACCEL_BUFFERING};
use crate::model::{ErrorData, JsonRpcMessage};

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

pub type BoxBody = UnsyncBoxBody<Bytes, Infallible>;
pub type BoxResponse = Response<BoxBody>;

/// A message queued for an SSE stream, with the event id assigned by the
/// event store (if resumability is enabled).
#[derive(Debug, Clone)]
pub struct ServerSseMessage {
    pub event_id: Option<String>,
    pub message: Arc<JsonRpcMessage>,
}

const KEEP_ALIVE_FRAME: &[u8] = b":ping\n\n";

pub(crate) fn encode_sse_frame(message: &ServerSseMessage) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(message.message.as_ref())?;
    let mut output = String::from("event: message\n");
    if let Some(id) = &message.event_id {
        output.push_str(&format!("id: {id}\n"));
    }
    output.push_str(&format!("data: {data}\n\n"));
    Ok(Bytes::from(output))
}

enum SseFrame {
    Message(ServerSseMessage),
    Ping,
}

/// Turn a message channel into an SSE body.
///
/// The body ends when every sender of `rx` is gone. `guard` lives exactly as
/// long as the body, so dropping the response (client disconnect) drops it.
pub(crate) fn sse_body<G>(
    rx: UnboundedReceiver<ServerSseMessage>,
    keep_alive: Option<Duration>,
    guard: G,
) -> BoxBody
where
    G: Send + 'static,
{
    let ticker = keep_alive.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    let frames = stream::unfold(
        (rx, ticker, guard),
        |(mut rx, mut ticker, guard)| async move {
            loop {
                let frame = match ticker.as_mut() {
                    Some(ticker) => tokio::select! {
                        message = rx.recv() => match message {
                            Some(message) => SseFrame::Message(message),
                            None => return None,
                        },
                        _ = ticker.tick() => SseFrame::Ping,
                    },
                    None => SseFrame::Message(rx.recv().await?),
                };
                let bytes = match frame {
                    SseFrame::Ping => Bytes::from_static(KEEP_ALIVE_FRAME),
                    SseFrame::Message(message) => match encode_sse_frame(&message) {
                        Ok(bytes) => bytes,
                        Err(error) => {
                            tracing::error!(%error, "failed to encode sse message, skipped");
                            continue;
                        }
                    },
                };
                return Some((
                    Ok::<_, Infallible>(Frame::data(bytes)),
                    (rx, ticker, guard),
                ));
            }
        },
    );
    StreamBody::new(frames).boxed_unsync()
}

pub(crate) fn sse_response(body: BoxBody) -> BoxResponse {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}

pub(crate) fn json_response(status: StatusCode, body: Bytes) -> BoxResponse {
    let mut response = Response::new(Full::new(body).boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_MIME_TYPE),
    );
    response
}

pub(crate) fn empty_response(status: StatusCode) -> BoxResponse {
    let mut response = Response::new(Empty::new().boxed_unsync());
    *response.status_mut() = status;
    response
}

/// The shared error envelope: a JSON-RPC error with `id: null`.
pub(crate) fn error_response(status: StatusCode, error: ErrorData) -> BoxResponse {
    let envelope = JsonRpcMessage::error(None, error);
    match serde_json::to_vec(&envelope) {
        Ok(body) => json_response(status, body.into()),
        Err(error) => {
            tracing::error!(%error, "failed to encode error envelope");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_sse_frame_with_event_id() {
        let message = ServerSseMessage {
            event_id: Some("_GET_stream/3".into()),
            message: Arc::new(JsonRpcMessage::notification("notifications/message", None)),
        };
        let frame = encode_sse_frame(&message).unwrap();
        assert_eq!(
            frame,
            Bytes::from(
                "event: message\nid: _GET_stream/3\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n\n"
            )
        );
    }

    #[tokio::test]
    async fn test_error_response_envelope() {
        let response = error_response(
            StatusCode::NOT_ACCEPTABLE,
            ErrorData::transport("Not Acceptable"),
        );
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32000, "message": "Not Acceptable"}})
        );
    }

    #[tokio::test]
    async fn test_sse_body_ends_when_senders_drop() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut body = sse_body(rx, None, ());
        tx.send(ServerSseMessage {
            event_id: None,
            message: Arc::new(JsonRpcMessage::response(1.into(), json!({}))),
        })
        .unwrap();
        drop(tx);
        let frame = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(frame.starts_with(b"event: message\ndata: "));
        assert!(body.frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sse_body_emits_keep_alive() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<ServerSseMessage>();
        let mut body = sse_body(rx, Some(Duration::from_secs(15)), ());
        let frame = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(frame, Bytes::from_static(KEEP_ALIVE_FRAME));
        drop(tx);
    }
}
