use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, Error as _},
};
use serde_json::{Map, Value};

use super::{
    ErrorData, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion2_0, RequestId,
};

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(D::Error::invalid_value(
                de::Unexpected::Str(&version),
                &"\"2.0\"",
            ))
        }
    }
}

fn take_field<T, E>(map: &mut Map<String, Value>, key: &'static str) -> Result<Option<T>, E>
where
    T: for<'a> Deserialize<'a>,
    E: de::Error,
{
    map.remove(key)
        .map(|value| T::deserialize(value).map_err(|e| E::custom(format!("`{key}`: {e}"))))
        .transpose()
}

fn check_params<E: de::Error>(params: &Option<Value>) -> Result<(), E> {
    match params {
        None | Some(Value::Object(_)) | Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(E::custom("`params` must be an object or an array")),
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Value::Object(mut map) = Value::deserialize(deserializer)? else {
            return Err(D::Error::custom("a JSON-RPC message must be an object"));
        };
        let Some(JsonRpcVersion2_0) = take_field::<JsonRpcVersion2_0, D::Error>(&mut map, "jsonrpc")?
        else {
            return Err(D::Error::missing_field("jsonrpc"));
        };
        // `id: null` is only meaningful on an error reply
        let raw_id = map.remove("id");
        let method: Option<String> = take_field(&mut map, "method")?;
        let params: Option<Value> = map.remove("params");
        let result: Option<Value> = map.remove("result");
        let error: Option<ErrorData> = take_field(&mut map, "error")?;
        if let Some(unknown) = map.keys().next() {
            return Err(D::Error::unknown_field(
                unknown,
                &["jsonrpc", "id", "method", "params", "result", "error"],
            ));
        }
        let id = match raw_id {
            None => None,
            Some(Value::Null) => Some(None),
            Some(value) => Some(Some(
                RequestId::deserialize(value)
                    .map_err(|_| D::Error::custom("`id` must be a string or an integer"))?,
            )),
        };
        match (id, method, result, error) {
            (Some(Some(id)), Some(method), None, None) => {
                check_params(&params)?;
                Ok(JsonRpcMessage::Request(JsonRpcRequest {
                    jsonrpc: JsonRpcVersion2_0,
                    id,
                    method,
                    params,
                }))
            }
            (None, Some(method), None, None) => {
                check_params(&params)?;
                Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                    jsonrpc: JsonRpcVersion2_0,
                    method,
                    params,
                }))
            }
            (Some(Some(id)), None, Some(result), None) if params.is_none() => {
                Ok(JsonRpcMessage::Response(JsonRpcResponse {
                    jsonrpc: JsonRpcVersion2_0,
                    id,
                    result,
                }))
            }
            (Some(id), None, None, Some(error)) if params.is_none() => {
                Ok(JsonRpcMessage::Error(JsonRpcError {
                    jsonrpc: JsonRpcVersion2_0,
                    id,
                    error,
                }))
            }
            _ => Err(D::Error::custom(
                "not a valid JSON-RPC request, notification, response or error",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> Result<JsonRpcMessage, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[test]
    fn test_classify_shapes() {
        assert!(matches!(
            parse(json!({"jsonrpc": "2.0", "id": "a", "method": "ping"})),
            Ok(JsonRpcMessage::Request(_))
        ));
        assert!(matches!(
            parse(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})),
            Ok(JsonRpcMessage::Notification(_))
        ));
        assert!(matches!(
            parse(json!({"jsonrpc": "2.0", "id": 3, "result": {}})),
            Ok(JsonRpcMessage::Response(_))
        ));
        assert!(matches!(
            parse(json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32600, "message": "x"}})),
            Ok(JsonRpcMessage::Error(JsonRpcError { id: None, .. }))
        ));
    }

    #[test]
    fn test_reject_malformed() {
        // wrong version
        assert!(parse(json!({"jsonrpc": "1.0", "id": 1, "method": "ping"})).is_err());
        // missing version
        assert!(parse(json!({"id": 1, "method": "ping"})).is_err());
        // unknown member
        assert!(parse(json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "extra": 1})).is_err());
        // both result and error
        assert!(
            parse(json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": ""}}))
                .is_err()
        );
        // request with null id
        assert!(parse(json!({"jsonrpc": "2.0", "id": null, "method": "ping"})).is_err());
        // fractional id
        assert!(parse(json!({"jsonrpc": "2.0", "id": 1.5, "method": "ping"})).is_err());
        // scalar params
        assert!(parse(json!({"jsonrpc": "2.0", "method": "ping", "params": 3})).is_err());
        assert!(parse(json!([1, 2])).is_err());
    }

    #[test]
    fn test_serialize_request_omits_absent_params() {
        let message = JsonRpcMessage::request(7, "ping", None);
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"jsonrpc": "2.0", "id": 7, "method": "ping"})
        );
    }
}
