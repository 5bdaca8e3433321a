//! Tool, resource and prompt payload types.
//!
//! These are the public metadata returned by the `*/list` methods and the
//! params/results of `tools/call`, `resources/read` and `prompts/get`.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Lifecycle
// ============================================================================

/// Which provider kinds the server can serve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Resources can be registered.
    pub resources: bool,
    /// Tools can be registered.
    pub tools: bool,
    /// Prompts can be registered.
    pub prompts: bool,
}

impl ServerCapabilities {
    /// All provider kinds enabled.
    #[inline]
    #[must_use]
    pub const fn all() -> Self {
        Self {
            resources: true,
            tools: true,
            prompts: true,
        }
    }
}

/// Server name and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

/// Result of the `initialize` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision echoed to the client.
    pub protocol_version: String,
    /// Server identity.
    pub server_info: ServerInfo,
    /// Provider kinds.
    pub capabilities: ServerCapabilities,
}

// ============================================================================
// Descriptors
// ============================================================================

/// Public metadata of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Unique tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the `arguments` object.
    pub input_schema: Value,
}

/// Public metadata of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Virtual URI.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// What the resource contains.
    pub description: String,
    /// MIME type of the content.
    pub mime_type: String,
}

/// One argument accepted by a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// What the argument means.
    pub description: String,
    /// Whether the argument must be supplied.
    #[serde(default)]
    pub required: bool,
}

/// Public metadata of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptInfo {
    /// Unique prompt name.
    pub name: String,
    /// What the prompt generates.
    pub description: String,
    /// Accepted arguments.
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

// ============================================================================
// Contents
// ============================================================================

/// Content returned by `resources/read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    /// URI that was read.
    pub uri: String,
    /// MIME type of `text`.
    pub mime_type: String,
    /// Textual content.
    pub text: String,
}

/// One message of a generated prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// `user` or `assistant`.
    pub role: String,
    /// Text content.
    pub content: PromptContent,
}

impl PromptMessage {
    /// Creates a user text message.
    #[inline]
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: PromptContent::text(text),
        }
    }
}

/// Text content block of a prompt message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContent {
    /// Always `text`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// The text.
    pub text: String,
}

impl PromptContent {
    /// Creates a text block.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPromptResult {
    /// Description of the generated prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Generated messages.
    pub messages: Vec<PromptMessage>,
}

// ============================================================================
// Method Params
// ============================================================================

/// Params of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments, passed verbatim to the handler.
    #[serde(default)]
    pub arguments: Value,
}

/// Params of `resources/read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResourceParams {
    /// Resource URI.
    pub uri: String,
}

/// Params of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptParams {
    /// Prompt name.
    pub name: String,
    /// Prompt arguments.
    #[serde(default)]
    pub arguments: Value,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_info_camel_case() {
        let info = ToolInfo {
            name: "echo".into(),
            description: "Echo params".into(),
            input_schema: json!({"type": "object"}),
        };
        let value = serde_json::to_value(&info).expect("serialize");
        assert!(value.get("inputSchema").is_some());
    }

    #[test]
    fn test_call_tool_params_default_arguments() {
        let params: CallToolParams =
            serde_json::from_value(json!({"name": "echo"})).expect("parse");
        assert_eq!(params.arguments, Value::Null);
    }

    #[test]
    fn test_capabilities_all() {
        let caps = ServerCapabilities::all();
        assert_eq!(
            serde_json::to_value(caps).expect("serialize"),
            json!({"resources": true, "tools": true, "prompts": true})
        );
        assert!(!ServerCapabilities::default().tools);
    }
}
