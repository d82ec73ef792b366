#![allow(dead_code)]
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use mcp_streamable_http::{
    BoxError, MessageHandler, RequestInfo, StreamableHttpServerConfig,
    StreamableHttpServerTransport, TransportError, async_trait,
    model::{ErrorData, JsonRpcMessage},
    transport::common::server_side_http::{BoxBody, BoxResponse},
};
use serde_json::{Value, json};

pub const ACCEPT_BOTH: &str = "application/json, text/event-stream";
pub const ACCEPT_SSE: &str = "text/event-stream";

#[derive(Debug, Default)]
pub struct Counters {
    pub notifications: AtomicUsize,
    pub errors: AtomicUsize,
    pub closes: AtomicUsize,
}

/// Answers `initialize`, `ping` and `echo` directly, and exercises the other
/// routing paths through a few extra methods:
///
/// - `progress`: a related notification, then the response
/// - `slow_progress`: like `progress`, with a second's work in between
/// - `broadcast`: a notification on the standalone stream, then the response
/// - `later`: the response is sent from a spawned task
/// - `never`: no response at all
/// - `fail`: the handler returns an error
///
/// With `reject_initialize` set, `initialize` fails too.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    pub counters: Arc<Counters>,
    pub reject_initialize: bool,
}

impl EchoHandler {
    pub fn rejecting_initialize() -> Self {
        Self {
            reject_initialize: true,
            ..Self::default()
        }
    }

    pub fn notifications(&self) -> usize {
        self.counters.notifications.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.counters.errors.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_message(
        &self,
        message: JsonRpcMessage,
        _info: RequestInfo,
        transport: StreamableHttpServerTransport,
    ) -> Result<(), BoxError> {
        let JsonRpcMessage::Request(request) = message else {
            self.counters.notifications.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };
        let id = request.id.clone();
        let params = request.params.clone().unwrap_or_else(|| json!({}));
        match request.method.as_str() {
            "initialize" if self.reject_initialize => {
                return Err("initialize rejected".into());
            }
            "initialize" => {
                let version = transport.negotiated_version().await.map(|v| v.to_string());
                let result = json!({
                    "protocolVersion": version,
                    "capabilities": {},
                    "serverInfo": { "name": "echo", "version": "0.1.0" }
                });
                transport.send(JsonRpcMessage::response(id, result)).await?;
            }
            "ping" => transport.send(JsonRpcMessage::response(id, json!({}))).await?,
            "echo" => transport.send(JsonRpcMessage::response(id, params)).await?,
            "progress" => {
                let progress = JsonRpcMessage::notification(
                    "notifications/progress",
                    Some(json!({ "progress": 50 })),
                );
                transport.send_related(progress, id.clone()).await?;
                transport.send(JsonRpcMessage::response(id, params)).await?;
            }
            "slow_progress" => {
                let progress = JsonRpcMessage::notification(
                    "notifications/progress",
                    Some(json!({ "progress": 0 })),
                );
                transport.send_related(progress, id.clone()).await?;
                tokio::time::sleep(Duration::from_secs(1)).await;
                transport.send(JsonRpcMessage::response(id, params)).await?;
            }
            "broadcast" => {
                let note = JsonRpcMessage::notification("notifications/message", Some(params));
                transport.send(note).await?;
                transport.send(JsonRpcMessage::response(id, json!({}))).await?;
            }
            "later" => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let reply = JsonRpcMessage::response(id, json!({ "late": true }));
                    if let Err(error) = transport.send(reply).await {
                        tracing::error!(%error, "late reply failed");
                    }
                });
            }
            "never" => {}
            "fail" => return Err("handler failure".into()),
            other => {
                let error = JsonRpcMessage::error(Some(id), ErrorData::method_not_found(other));
                transport.send(error).await?;
            }
        }
        Ok(())
    }

    fn on_error(&self, _error: &TransportError) {
        self.counters.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with_test_writer()
        .try_init();
}

pub async fn started_transport(
    config: StreamableHttpServerConfig,
) -> (StreamableHttpServerTransport, EchoHandler) {
    let transport = StreamableHttpServerTransport::new(config);
    let handler = EchoHandler::default();
    transport.start(Arc::new(handler.clone())).await.unwrap();
    (transport, handler)
}

pub fn initialize_body(id: i64, version: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": version,
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "1.0.0" }
        }
    })
}

pub fn request_body(id: i64, method: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method })
}

pub fn initialized_notification() -> Value {
    json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
}

pub fn post(body: &Value, headers: &[(&str, &str)]) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

pub fn get(headers: &[(&str, &str)]) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri("/mcp")
        .header("Accept", ACCEPT_SSE);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

pub fn delete(headers: &[(&str, &str)]) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(Method::DELETE).uri("/mcp");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

pub fn session_header(response: &BoxResponse) -> Option<String> {
    response
        .headers()
        .get("Mcp-Session-Id")
        .map(|value| value.to_str().unwrap().to_string())
}

/// Initialize `transport` and return the issued session id.
pub async fn initialize(transport: &StreamableHttpServerTransport, version: &str) -> String {
    let response = transport
        .handle_request(post(&initialize_body(1, version), &[]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = session_header(&response).expect("session id header");
    let messages = sse_messages(response).await;
    assert_eq!(messages[0]["result"]["protocolVersion"], version);
    session_id
}

pub async fn body_bytes(response: BoxResponse) -> Bytes {
    tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("body finished in time")
        .unwrap()
        .to_bytes()
}

pub async fn body_json(response: BoxResponse) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Every `data:` payload of an SSE body that runs to completion.
pub async fn sse_messages(response: BoxResponse) -> Vec<Value> {
    let body = body_bytes(response).await;
    parse_sse_data(&String::from_utf8_lossy(&body))
}

pub fn parse_sse_data(text: &str) -> Vec<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

/// Read frames until the next SSE event with a payload; keep-alive comments
/// are skipped.
pub async fn next_sse_event(body: &mut BoxBody) -> Option<String> {
    let read = async {
        while let Some(frame) = body.frame().await {
            let Ok(data) = frame.unwrap().into_data() else {
                continue;
            };
            let text = String::from_utf8_lossy(&data).to_string();
            if text.contains("data: ") {
                return Some(text);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("sse event in time")
}
