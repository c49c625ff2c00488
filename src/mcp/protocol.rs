//! JSON-RPC 2.0 message types and envelope codec.
//!
//! This module defines the four message kinds exchanged by both sides of a
//! session and the rules used to classify an inbound JSON object.
//!
//! # Message Types
//!
//! - **Request**: has `id` and `method`, expects a reply
//! - **Response**: has `id` and `result`
//! - **Error**: has `id` (possibly `null`) and `error`
//! - **Notification**: has `method` and no `id`, no reply expected
//!
//! # Constraints
//!
//! - Request IDs must be strings or integers (never `null`)
//! - Request IDs must be unique among the issuer's outstanding requests
//! - Batches (JSON arrays) are rejected as invalid requests

use std::fmt;

use serde::de::{DeserializeOwned, Error as _};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// The JSON-RPC version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// The protocol version this implementation speaks.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Server name for capability negotiation.
pub const SERVER_NAME: &str = "mcp-runtime";

/// Reserved method names consumed by the runtime.
pub mod methods {
    /// Handshake request sent by the client.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification sent by the client.
    pub const INITIALIZED: &str = "initialized";
    /// Alternate spelling of [`INITIALIZED`] accepted from peers.
    pub const INITIALIZED_ALIAS: &str = "notifications/initialized";
    /// Liveness check, answered with an empty object.
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Best-effort request cancellation.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Progress report for a long-running request.
    pub const PROGRESS: &str = "notifications/progress";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}

/// A JSON-RPC 2.0 request ID.
///
/// IDs must be strings or integers, never `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl RequestId {
    /// Reads an ID from a JSON value, rejecting `null`, floats, and non-scalars.
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// Unique request identifier.
    pub id: RequestId,

    /// The method to invoke.
    pub method: String,

    /// Optional parameters for the method.
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a new request.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Deserialises the request parameters into `T`.
    ///
    /// # Errors
    ///
    /// Returns an invalid params error if the parameters are missing or do not
    /// match the expected shape.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, JsonRpcErrorData> {
        let params = self.params.clone().ok_or_else(|| {
            JsonRpcErrorData::with_message(
                ErrorCode::InvalidParams,
                format!("Missing params for {}", self.method),
            )
        })?;

        serde_json::from_value(params).map_err(|e| {
            JsonRpcErrorData::with_message(
                ErrorCode::InvalidParams,
                format!("Invalid params for {}: {e}", self.method),
            )
        })
    }
}

/// A JSON-RPC 2.0 notification message.
///
/// Notifications do not have an ID and do not expect a response.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    /// The notification method.
    pub method: String,

    /// Optional parameters for the notification.
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Creates a progress notification.
    #[must_use]
    pub fn progress(
        progress_token: &RequestId,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> Self {
        let params = serde_json::json!({
            "progressToken": progress_token,
            "progress": progress,
            "total": total,
            "message": message,
        });
        Self::new(methods::PROGRESS, Some(params))
    }

    /// Creates a cancellation notification for an outstanding request.
    #[must_use]
    pub fn cancelled(request_id: &RequestId, reason: Option<&str>) -> Self {
        let params = serde_json::json!({
            "requestId": request_id,
            "reason": reason,
        });
        Self::new(methods::CANCELLED, Some(params))
    }
}

/// A successful JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// The request ID this response corresponds to.
    pub id: RequestId,

    /// The result of the method call.
    pub result: Value,
}

impl JsonRpcResponse {
    /// Creates a new success response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: RequestId, result: Value) -> Self {
        Self { id, result }
    }
}

/// Standard JSON-RPC 2.0 error codes plus the application codes used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// The peer asked for a protocol version with a different major version.
    UnsupportedProtocolVersion,
    /// A resource URI is not registered.
    ResourceNotFound,
    /// Server-defined error.
    ServerError(i32),
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::UnsupportedProtocolVersion => -32000,
            Self::ResourceNotFound => -32002,
            Self::ServerError(code) => code,
        }
    }

    /// Maps a numeric code back to a known variant.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::UnsupportedProtocolVersion,
            -32002 => Self::ResourceNotFound,
            other => Self::ServerError(other),
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::UnsupportedProtocolVersion => "Unsupported protocol version",
            Self::ResourceNotFound => "Resource not found",
            Self::ServerError(_) => "Server error",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns the symbolic code of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InvalidRequest, message)
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::with_message(
            ErrorCode::MethodNotFound,
            format!("Method not found: {method}"),
        )
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InvalidParams, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for JsonRpcErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// A JSON-RPC 2.0 error response.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    /// The request ID this error corresponds to, `None` when it could not be
    /// determined (serialised as `null`).
    pub id: Option<RequestId>,

    /// The error details.
    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Creates a new error response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // JsonRpcErrorData contains String
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self { id, error }
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(None, JsonRpcErrorData::from_code(ErrorCode::ParseError))
    }

    /// Creates an invalid request error response.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(id, JsonRpcErrorData::invalid_request(message))
    }
}

/// Any JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request expecting a response.
    Request(JsonRpcRequest),
    /// A successful reply.
    Response(JsonRpcResponse),
    /// An error reply.
    Error(JsonRpcError),
    /// A notification (no response expected).
    Notification(JsonRpcNotification),
}

impl Message {
    /// Returns the request ID carried by this message, if any.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => Some(&resp.id),
            Self::Error(err) => err.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Returns the method name of requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) | Self::Error(_) => None,
        }
    }

    /// Short name of the message kind, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
            Self::Notification(_) => "notification",
        }
    }

    /// Classifies a decoded JSON value as one of the four message kinds.
    ///
    /// # Errors
    ///
    /// Returns an invalid request error response when the value is not a
    /// well-formed JSON-RPC 2.0 envelope. The error carries the request ID
    /// whenever one could be read.
    pub fn from_value(value: Value) -> Result<Self, JsonRpcError> {
        let Value::Object(mut obj) = value else {
            let reason = if value.is_array() {
                "batch messages are not supported"
            } else {
                "message must be a JSON object"
            };
            return Err(JsonRpcError::invalid_request(None, reason));
        };

        let raw_id = obj.remove("id");
        let id = raw_id.as_ref().and_then(RequestId::from_json);

        if raw_id.as_ref().is_some_and(|v| !v.is_null()) && id.is_none() {
            return Err(JsonRpcError::invalid_request(
                None,
                "id must be a string or an integer",
            ));
        }

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            _ => {
                return Err(JsonRpcError::invalid_request(
                    id,
                    "jsonrpc field must be \"2.0\"",
                ))
            }
        }

        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(m)) if !m.is_empty() => Some(m),
            Some(_) => {
                return Err(JsonRpcError::invalid_request(
                    id,
                    "method must be a non-empty string",
                ))
            }
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => None,
            Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p),
            Some(_) => {
                return Err(JsonRpcError::invalid_request(
                    id,
                    "params must be an object or an array",
                ))
            }
        };

        let result = obj.remove("result");
        let error = obj.remove("error");

        match (raw_id.is_some(), method, result, error) {
            (true, Some(method), None, None) => {
                let id = id.ok_or_else(|| {
                    JsonRpcError::invalid_request(None, "request id must not be null")
                })?;
                Ok(Self::Request(JsonRpcRequest { id, method, params }))
            }
            (false, Some(method), None, None) => {
                Ok(Self::Notification(JsonRpcNotification { method, params }))
            }
            (true, None, Some(result), None) => {
                let id = id.ok_or_else(|| {
                    JsonRpcError::invalid_request(None, "response id must not be null")
                })?;
                Ok(Self::Response(JsonRpcResponse { id, result }))
            }
            (true, None, None, Some(error)) => {
                let error: JsonRpcErrorData = serde_json::from_value(error).map_err(|_| {
                    JsonRpcError::invalid_request(id.clone(), "malformed error object")
                })?;
                Ok(Self::Error(JsonRpcError { id, error }))
            }
            _ => Err(JsonRpcError::invalid_request(
                id,
                "message is neither a request, a response, nor a notification",
            )),
        }
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(value: JsonRpcRequest) -> Self {
        Self::Request(value)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(value: JsonRpcResponse) -> Self {
        Self::Response(value)
    }
}

impl From<JsonRpcError> for Message {
    fn from(value: JsonRpcError) -> Self {
        Self::Error(value)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(value: JsonRpcNotification) -> Self {
        Self::Notification(value)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;

        match self {
            Self::Request(req) => {
                map.serialize_entry("id", &req.id)?;
                map.serialize_entry("method", &req.method)?;
                if let Some(params) = &req.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Response(resp) => {
                map.serialize_entry("id", &resp.id)?;
                map.serialize_entry("result", &resp.result)?;
            }
            Self::Error(err) => {
                map.serialize_entry("id", &err.id)?;
                map.serialize_entry("error", &err.error)?;
            }
            Self::Notification(notif) => {
                map.serialize_entry("method", &notif.method)?;
                if let Some(params) = &notif.params {
                    map.serialize_entry("params", params)?;
                }
            }
        }

        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(|e| D::Error::custom(e.error.message))
    }
}

/// Parses a JSON string into a message.
///
/// # Errors
///
/// Returns a parse error (-32700) for malformed JSON and an invalid request
/// error (-32600) for JSON that is not a JSON-RPC 2.0 envelope.
pub fn parse_message(json: &str) -> Result<Message, JsonRpcError> {
    let value: Value = serde_json::from_str(json).map_err(|_| JsonRpcError::parse_error())?;
    Message::from_value(value)
}

/// Serialises a message to a single-line JSON string.
///
/// # Errors
///
/// Returns an error if a payload cannot be represented as JSON.
pub fn to_json(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Converts a serialisable payload into a JSON object, for use as `params`.
///
/// Non-object payloads are wrapped as `{"value": ...}`.
#[must_use]
pub fn object_params(payload: Value) -> Value {
    match payload {
        Value::Object(_) => payload,
        Value::Null => Value::Object(Map::new()),
        other => serde_json::json!({ "value": other }),
    }
}
