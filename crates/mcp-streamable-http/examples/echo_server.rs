use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use mcp_streamable_http::{
    BoxError, MessageHandler, RequestInfo, StreamableHttpServerConfig,
    StreamableHttpServerTransport, StreamableHttpService, async_trait,
    model::{ErrorData, JsonRpcMessage, ProtocolVersion},
    serde_json::json,
};

const BIND_ADDRESS: &str = "127.0.0.1:8000";

/// `ping`, `echo` and a per-session counter.
#[derive(Debug, Default)]
struct Counter {
    count: Arc<AtomicI64>,
}

#[async_trait]
impl MessageHandler for Counter {
    async fn on_message(
        &self,
        message: JsonRpcMessage,
        info: RequestInfo,
        transport: StreamableHttpServerTransport,
    ) -> Result<(), BoxError> {
        let request = match message {
            JsonRpcMessage::Request(request) => request,
            other => {
                tracing::debug!(method = ?other.method(), "non-request message");
                return Ok(());
            }
        };
        tracing::debug!(method = %request.method, headers = ?info.headers, "request");
        let reply = match request.method.as_str() {
            "initialize" => {
                let version = transport
                    .negotiated_version()
                    .await
                    .unwrap_or(ProtocolVersion::LATEST);
                JsonRpcMessage::response(
                    request.id,
                    json!({
                        "protocolVersion": version.as_str(),
                        "capabilities": {},
                        "serverInfo": { "name": "echo-server", "version": env!("CARGO_PKG_VERSION") }
                    }),
                )
            }
            "ping" => JsonRpcMessage::response(request.id, json!({})),
            "echo" => JsonRpcMessage::response(request.id, request.params.unwrap_or_default()),
            "increment" => {
                let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                transport
                    .send(JsonRpcMessage::notification(
                        "notifications/message",
                        Some(json!({ "level": "info", "data": format!("count is {count}") })),
                    ))
                    .await?;
                JsonRpcMessage::response(request.id, json!({ "count": count }))
            }
            "get_value" => {
                JsonRpcMessage::response(request.id, json!({ "count": self.count.load(Ordering::SeqCst) }))
            }
            other => JsonRpcMessage::error(Some(request.id), ErrorData::method_not_found(other)),
        };
        transport.send(reply).await?;
        Ok(())
    }

    fn on_close(&self) {
        tracing::info!(count = self.count.load(Ordering::SeqCst), "session closed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let service = StreamableHttpService::new(
        || Ok(Counter::default()),
        StreamableHttpServerConfig::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(BIND_ADDRESS).await?;
    tracing::info!("listening on http://{BIND_ADDRESS}/mcp");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
