//! Payload types for the standard methods.
//!
//! These are the `params` and `result` shapes of `initialize`, `tools/*`,
//! `resources/*`, `prompts/*`, and the runtime notifications.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::capability::CapabilitySet;
use super::protocol::RequestId;

/// Name and version of one side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    /// Describes this crate.
    #[must_use]
    pub fn this_crate(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Parameters of `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by the client.
    pub protocol_version: String,

    /// Capabilities the client advertises.
    #[serde(default, alias = "capabilities")]
    pub client_capabilities: CapabilitySet,

    /// Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
}

/// Result of `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version chosen by the server.
    pub protocol_version: String,

    /// Capabilities the server advertises.
    #[serde(default, alias = "capabilities")]
    pub server_capabilities: CapabilitySet,

    /// Server name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,

    /// Free-form usage hints for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A tool as listed by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// The tool name.
    pub name: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

impl ToolDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolDefinition>,
}

/// Request-scoped metadata carried in `params._meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Token the caller wants progress notifications tagged with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<RequestId>,
}

/// Parameters of `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    /// The tool name.
    pub name: String,

    /// Arguments for the tool.
    #[serde(default, alias = "params")]
    pub arguments: Value,

    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ToolContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// The content returned by the tool.
    pub content: Vec<ToolContent>,

    /// Whether the tool reported a domain-level failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    /// Machine-readable copy of the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolCallResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
            structured_content: None,
        }
    }

    /// Creates a result carrying a JSON value both as text and structured.
    #[must_use]
    pub fn json(value: Value) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
            structured_content: Some(value),
        }
    }

    /// Creates a domain-level error result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(message)],
            is_error: true,
            structured_content: None,
        }
    }

    /// Concatenates all text blocks.
    #[must_use]
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A resource as listed by `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Result of `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    pub resources: Vec<ResourceDefinition>,
}

/// Parameters of `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

/// The contents of a resource, as text or base64 blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceContents {
    Text {
        uri: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        text: String,
    },
    Blob {
        uri: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        blob: String,
    },
}

impl ResourceContents {
    #[must_use]
    pub fn text(uri: impl Into<String>, mime_type: Option<&str>, text: impl Into<String>) -> Self {
        Self::Text {
            uri: uri.into(),
            mime_type: mime_type.map(str::to_string),
            text: text.into(),
        }
    }

    /// Encodes binary contents as base64.
    #[must_use]
    pub fn blob(uri: impl Into<String>, mime_type: Option<&str>, bytes: &[u8]) -> Self {
        Self::Blob {
            uri: uri.into(),
            mime_type: mime_type.map(str::to_string),
            blob: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            Self::Text { uri, .. } | Self::Blob { uri, .. } => uri,
        }
    }

    /// Returns the raw bytes of the contents.
    ///
    /// # Errors
    ///
    /// Returns an error if a blob is not valid base64.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            Self::Text { text, .. } => Ok(text.as_bytes().to_vec()),
            Self::Blob { blob, .. } => base64::engine::general_purpose::STANDARD.decode(blob),
        }
    }
}

/// Result of `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

/// A declared prompt argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl PromptArgument {
    #[must_use]
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            required: true,
        }
    }

    #[must_use]
    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            required: false,
        }
    }
}

/// A prompt as listed by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Result of `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPromptsResult {
    pub prompts: Vec<PromptDefinition>,
}

/// Parameters of `prompts/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

/// Speaker of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    User,
    Assistant,
}

/// One message of a rendered prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: ToolContent,
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// Parameters of `notifications/cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Parameters of `notifications/progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: RequestId,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_params_accept_capabilities_alias() {
        let params: InitializeParams = serde_json::from_value(json!({
            "protocolVersion": "1.0",
            "capabilities": {"tools": {}}
        }))
        .unwrap();
        assert!(params.client_capabilities.get("tools").is_some());
        assert!(params.client_info.is_none());

        let out = serde_json::to_value(&params).unwrap();
        assert!(out.get("clientCapabilities").is_some());
    }

    #[test]
    fn tool_definition_uses_camel_case_schema() {
        let tool = ToolDefinition::new("echo", "Echo", json!({"type": "object"}));
        let value = serde_json::to_value(&tool).unwrap();
        assert!(value.get("inputSchema").is_some());
    }

    #[test]
    fn tool_call_params_read_progress_token() {
        let params: ToolCallParams = serde_json::from_value(json!({
            "name": "slow",
            "arguments": {"n": 1},
            "_meta": {"progressToken": "tok"}
        }))
        .unwrap();
        assert_eq!(
            params.meta.and_then(|m| m.progress_token),
            Some(RequestId::from("tok"))
        );
    }

    #[test]
    fn tool_call_params_default_to_null_arguments() {
        let params: ToolCallParams = serde_json::from_value(json!({"name": "x"})).unwrap();
        assert!(params.arguments.is_null());
    }

    #[test]
    fn error_result_sets_is_error() {
        let ok = serde_json::to_value(ToolCallResult::text("fine")).unwrap();
        assert!(ok.get("isError").is_none());

        let err = serde_json::to_value(ToolCallResult::error("nope")).unwrap();
        assert_eq!(err["isError"], true);
        assert_eq!(err["content"][0]["type"], "text");
    }

    #[test]
    fn blob_contents_are_base64() {
        let contents = ResourceContents::blob("mem://x", Some("application/octet-stream"), &[0, 1, 2, 255]);
        let value = serde_json::to_value(&contents).unwrap();
        assert_eq!(value["blob"], "AAEC/w==");

        let back: ResourceContents = serde_json::from_value(value).unwrap();
        assert_eq!(back.bytes().unwrap(), vec![0, 1, 2, 255]);
        assert_eq!(back.uri(), "mem://x");
    }

    #[test]
    fn text_contents_deserialise_as_text() {
        let contents: ResourceContents =
            serde_json::from_value(json!({"uri": "a://b", "text": "hello"})).unwrap();
        assert!(matches!(contents, ResourceContents::Text { .. }));
    }
}
