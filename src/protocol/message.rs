//! Request, Notification and Response message types.
//!
//! # Format
//!
//! Request:
//! ```json
//! { "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { ... } }
//! ```
//!
//! Notification:
//! ```json
//! { "jsonrpc": "2.0", "method": "notifications/initialized" }
//! ```
//!
//! Response:
//! ```json
//! { "jsonrpc": "2.0", "id": 1, "result": { ... } }
//! { "jsonrpc": "2.0", "id": 1, "error": { "code": -32601, "message": "..." } }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// Request
// ============================================================================

/// A call that expects exactly one [`Response`] with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Optional parameters.
    pub params: Option<Value>,
}

impl Request {
    /// Creates a new request.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Returns the params, or `Value::Null` when absent.
    #[inline]
    #[must_use]
    pub fn params_or_null(&self) -> Value {
        self.params.clone().unwrap_or(Value::Null)
    }
}

// ============================================================================
// Notification
// ============================================================================

/// A one-way message that is never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Optional parameters.
    pub params: Option<Value>,
}

impl Notification {
    /// Creates a new notification.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

// ============================================================================
// RpcError
// ============================================================================

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Creates an error without data.
    #[inline]
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured data.
    #[inline]
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&Error> for RpcError {
    fn from(err: &Error) -> Self {
        let rpc = Self::new(err.rpc_code(), err.to_string());
        match err {
            Error::Remote { data, .. } => Self { data: data.clone(), ..rpc },
            Error::ToolNotFound { name } => rpc.with_data(json!({ "kind": "tool", "name": name })),
            Error::ResourceNotFound { uri } => {
                rpc.with_data(json!({ "kind": "resource", "name": uri }))
            }
            Error::PromptNotFound { name } => {
                rpc.with_data(json!({ "kind": "prompt", "name": name }))
            }
            _ => rpc,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered. `None` only for parse errors.
    pub id: Option<RequestId>,
    /// Either the result value or the error.
    pub outcome: std::result::Result<Value, RpcError>,
}

impl Response {
    /// Creates a success response.
    #[inline]
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    /// Creates an error response.
    #[inline]
    #[must_use]
    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    /// Creates an error response from a crate error.
    #[inline]
    #[must_use]
    pub fn from_error(id: RequestId, err: &Error) -> Self {
        Self::error(Some(id), RpcError::from(err))
    }

    /// Returns `true` if this is an error response.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Returns the result, converting an error payload to [`Error::Remote`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the peer answered with an error.
    pub fn into_result(self) -> Result<Value> {
        self.outcome.map_err(|e| Error::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        })
    }
}

// ============================================================================
// Message
// ============================================================================

/// Any inbound or outbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Has `id` and `method`.
    Request(Request),
    /// Has `method` and no `id`.
    Notification(Notification),
    /// Has `id` and one of `result` / `error`.
    Response(Response),
}

impl Message {
    /// Classifies a parsed JSON document by field presence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the value is not an object, carries a
    /// foreign `jsonrpc` version, or matches none of the three shapes.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(Error::protocol("message is not a JSON object"));
        };

        if let Some(version) = obj.get("jsonrpc")
            && version.as_str() != Some(JSONRPC_VERSION)
        {
            return Err(Error::protocol(format!("unsupported jsonrpc version: {version}")));
        }

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw)?),
        };

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(Error::protocol("method must be a string"));
            };
            let params = obj.remove("params");

            return Ok(match id {
                Some(id) => Self::Request(Request { id, method, params }),
                None => Self::Notification(Notification { method, params }),
            });
        }

        if let Some(error) = obj.remove("error") {
            let error: RpcError = serde_json::from_value(error)?;
            return Ok(Self::Response(Response::error(id, error)));
        }

        if let Some(result) = obj.remove("result") {
            let Some(id) = id else {
                return Err(Error::protocol("success response without id"));
            };
            return Ok(Self::Response(Response::success(id, result)));
        }

        Err(Error::protocol("message has neither method nor result/error"))
    }

    /// Parses and classifies a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed JSON or [`Error::Protocol`]
    /// for an unclassifiable document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    /// Parses and classifies a JSON string.
    ///
    /// # Errors
    ///
    /// See [`Message::from_slice`].
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_slice(text.as_bytes())
    }

    /// Converts the message to its wire representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));

        match self {
            Self::Request(request) => {
                obj.insert("id".into(), id_value(Some(&request.id)));
                obj.insert("method".into(), Value::from(request.method.as_str()));
                if let Some(params) = &request.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification(notification) => {
                obj.insert("method".into(), Value::from(notification.method.as_str()));
                if let Some(params) = &notification.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response(response) => {
                obj.insert("id".into(), id_value(response.id.as_ref()));
                match &response.outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert("error".into(), json!(error));
                    }
                }
            }
        }

        Value::Object(obj)
    }

    /// Serializes the message to compact JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    /// Returns the id of requests and responses.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => r.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Returns the method of requests and notifications.
    #[inline]
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Short kind label for logging.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

fn id_value(id: Option<&RequestId>) -> Value {
    match id {
        Some(RequestId::Number(n)) => Value::from(*n),
        Some(RequestId::String(s)) => Value::from(s.as_str()),
        None => Value::Null,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::codes;

    #[test]
    fn test_classify_request() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .expect("parse");
        assert!(matches!(msg, Message::Request(ref r) if r.method == "tools/list"));
        assert_eq!(msg.id(), Some(&RequestId::Number(1)));
    }

    #[test]
    fn test_classify_notification() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .expect("parse");
        assert_eq!(msg.kind(), "notification");
        assert!(msg.id().is_none());
    }

    #[test]
    fn test_classify_response_with_null_result() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","id":"a","result":null}"#).expect("parse");
        match msg {
            Message::Response(r) => {
                assert_eq!(r.id, Some(RequestId::from("a")));
                assert_eq!(r.outcome, Ok(Value::Null));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let msg = Message::parse(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Tool not found: x"}}"#,
        )
        .expect("parse");
        let Message::Response(response) = msg else {
            panic!("expected response");
        };
        assert!(response.is_error());
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, Error::Remote { code: -32601, .. }));
    }

    #[test]
    fn test_remote_error_converts_back_verbatim() {
        let original = RpcError::new(codes::METHOD_NOT_FOUND, "Tool not found: x")
            .with_data(json!({"kind": "tool", "name": "x"}));
        let response = Response::error(Some(RequestId::from(4_i64)), original.clone());

        let err = response.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Tool not found: x");
        assert_eq!(RpcError::from(&err), original);
    }

    #[test]
    fn test_rejects_unclassifiable() {
        assert!(Message::parse(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        assert!(Message::parse(r#"[1,2,3]"#).is_err());
        assert!(Message::parse(r#"{"jsonrpc":"1.0","method":"x"}"#).is_err());
        assert!(Message::parse("not json").is_err());
    }

    #[test]
    fn test_wire_shape() {
        let msg = Message::from(Request::new(7_i64, "tools/call", Some(json!({"name": "echo"}))));
        let value = msg.to_value();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["params"]["name"], "echo");

        let notification = Message::from(Notification::new("bridge/hello", None));
        assert!(notification.to_value().get("params").is_none());
        assert!(notification.to_value().get("id").is_none());
    }

    #[test]
    fn test_not_found_error_carries_kind() {
        let rpc = RpcError::from(&Error::tool_not_found("nonexistent"));
        assert_eq!(rpc.code, -32601);
        assert_eq!(rpc.data, Some(json!({"kind": "tool", "name": "nonexistent"})));
    }

    #[test]
    fn test_serde_roundtrip_through_value() {
        let original = Message::from(Response::success(RequestId::Number(5), json!({"ok": true})));
        let text = serde_json::to_string(&original).expect("serialize");
        let parsed: Message = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(parsed, original);
    }
}
