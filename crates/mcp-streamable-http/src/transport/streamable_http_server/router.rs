//! Inbound classification and outbound channel resolution.
//!
//! Inbound, a POST body is either one JSON-RPC message or a batch. A batch is
//! accepted or rejected as a unit: one malformed element fails the whole body.
//!
//! Outbound, every message the handler sends is routed to one of three places,
//! see [`OutboundChannel`].

use serde_json::Value;

use crate::model::{ErrorData, JsonRpcMessage, RequestId};

/// The messages of one POST, in array order.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundBatch {
    pub messages: Vec<JsonRpcMessage>,
    /// Whether the body was a JSON array, even of one element.
    pub is_batch: bool,
}

impl InboundBatch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_requests(&self) -> bool {
        self.messages.iter().any(JsonRpcMessage::is_request)
    }

    /// Ids of the request-type messages, in array order.
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.messages
            .iter()
            .filter_map(JsonRpcMessage::request_id)
            .cloned()
            .collect()
    }

    pub fn initialize_request(&self) -> Option<&JsonRpcMessage> {
        self.messages
            .iter()
            .find(|message| message.is_initialize_request())
    }

    pub fn has_initialize(&self) -> bool {
        self.initialize_request().is_some()
    }
}

impl IntoIterator for InboundBatch {
    type Item = JsonRpcMessage;
    type IntoIter = std::vec::IntoIter<JsonRpcMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

fn parse_error(detail: impl std::fmt::Display) -> ErrorData {
    ErrorData::parse_error(format!("Parse error: {detail}"), None)
}

/// Parse a POST body into one or many JSON-RPC messages.
pub fn classify(body: &[u8]) -> Result<InboundBatch, ErrorData> {
    let value: Value = serde_json::from_slice(body).map_err(parse_error)?;
    match value {
        Value::Array(elements) => {
            if elements.is_empty() {
                return Err(parse_error("empty batch"));
            }
            let messages = elements
                .into_iter()
                .enumerate()
                .map(|(index, element)| {
                    serde_json::from_value(element)
                        .map_err(|error| parse_error(format!("batch element {index}: {error}")))
                })
                .collect::<Result<Vec<JsonRpcMessage>, _>>()?;
            Ok(InboundBatch {
                messages,
                is_batch: true,
            })
        }
        value @ Value::Object(_) => {
            let message = serde_json::from_value(value).map_err(parse_error)?;
            Ok(InboundBatch {
                messages: vec![message],
                is_batch: false,
            })
        }
        _ => Err(parse_error("expected a JSON-RPC object or array")),
    }
}

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundChannel {
    /// A response or error: the stream waiting on this request id.
    RequestWise(RequestId),
    /// A request or notification issued while handling this request id: that
    /// request's SSE stream, if it is still open.
    Related(RequestId),
    /// Everything else: the standalone GET stream.
    Standalone,
}

pub fn resolve_outbound_channel(
    message: &JsonRpcMessage,
    related: Option<&RequestId>,
) -> OutboundChannel {
    match message {
        JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => match message.response_id() {
            Some(id) => OutboundChannel::RequestWise(id.clone()),
            // an error with a null id answers nothing in particular
            None => OutboundChannel::Standalone,
        },
        JsonRpcMessage::Request(_) | JsonRpcMessage::Notification(_) => match related {
            Some(id) => OutboundChannel::Related(id.clone()),
            None => OutboundChannel::Standalone,
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::ErrorCode;

    #[test]
    fn test_classify_single_message() {
        let batch = classify(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(!batch.is_batch);
        assert!(batch.has_requests());
        assert_eq!(batch.request_ids(), vec![RequestId::Number(1)]);
    }

    #[test]
    fn test_classify_batch_keeps_order() {
        let body = json!([
            {"jsonrpc": "2.0", "method": "notifications/progress"},
            {"jsonrpc": "2.0", "id": "b", "method": "tools/list"},
            {"jsonrpc": "2.0", "id": 7, "method": "ping"},
        ]);
        let batch = classify(body.to_string().as_bytes()).unwrap();
        assert!(batch.is_batch);
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.request_ids(),
            vec![RequestId::from("b"), RequestId::Number(7)]
        );
    }

    #[test]
    fn test_one_bad_element_rejects_batch() {
        let body = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "ping"},
            {"jsonrpc": "1.0", "id": 2, "method": "ping"},
        ]);
        let error = classify(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(error.code, ErrorCode::PARSE_ERROR);
        assert!(error.message.contains("batch element 1"));
    }

    #[test]
    fn test_classify_rejects_garbage() {
        for body in [&b"not json"[..], b"[]", b"42", b"{\"id\":1}"] {
            let error = classify(body).unwrap_err();
            assert_eq!(error.code, ErrorCode::PARSE_ERROR);
        }
    }

    #[test]
    fn test_notifications_only_batch_has_no_requests() {
        let body = json!([
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 3, "result": {}},
        ]);
        let batch = classify(body.to_string().as_bytes()).unwrap();
        assert!(!batch.has_requests());
        assert!(batch.request_ids().is_empty());
    }

    #[test]
    fn test_outbound_channels() {
        let id = RequestId::Number(4);
        assert_eq!(
            resolve_outbound_channel(&JsonRpcMessage::response(id.clone(), json!({})), None),
            OutboundChannel::RequestWise(id.clone())
        );
        assert_eq!(
            resolve_outbound_channel(
                &JsonRpcMessage::error(None, ErrorData::internal_error("boom", None)),
                None
            ),
            OutboundChannel::Standalone
        );
        let progress = JsonRpcMessage::notification("notifications/progress", None);
        assert_eq!(
            resolve_outbound_channel(&progress, Some(&id)),
            OutboundChannel::Related(id)
        );
        assert_eq!(
            resolve_outbound_channel(&progress, None),
            OutboundChannel::Standalone
        );
    }
}
