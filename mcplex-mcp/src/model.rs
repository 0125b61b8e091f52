//! Framework-agnostic capability model.
//!
//! The gateway relays tool results, resource contents, and prompt
//! messages verbatim, so call results stay loosely typed as
//! [`serde_json::Value`] documents in MCP wire shape. Only the
//! capability *definitions* — what the registry indexes — get typed
//! representations here. Conversions to and from the `rmcp` SDK types
//! go through serde, which keeps this crate stable across SDK field
//! additions.

use serde::{Deserialize, Serialize};

/// A tool definition as listed by an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    /// Tool name as known to the upstream.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the tool's arguments.
    #[serde(default = "default_schema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// A resource definition as listed by an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    /// Resource URI as known to the upstream.
    pub uri: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One declared argument of a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// A prompt definition as listed by an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDef {
    /// Prompt name as known to the upstream.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared prompt arguments.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub arguments: Vec<PromptArgument>,
}

/// Upstreams serialize absent argument lists as `null`; treat that the
/// same as a missing field.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<PromptArgument>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize as _;
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

/// MCP `_meta` key under which a relayed x402 payment payload travels.
pub const PAYMENT_META_KEY: &str = "x402/payment";

/// MCP `_meta` key under which passthrough header pairs travel.
pub const FORWARDED_HEADERS_META_KEY: &str = "mcplex/headers";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_def_parses_wire_shape() {
        let json = serde_json::json!({
            "name": "ls",
            "description": "List files",
            "inputSchema": { "type": "object", "properties": {} }
        });
        let def: ToolDef = serde_json::from_value(json).unwrap();
        assert_eq!(def.name, "ls");
        assert_eq!(def.input_schema["type"], "object");
    }

    #[test]
    fn missing_schema_defaults_to_object() {
        let def: ToolDef = serde_json::from_value(serde_json::json!({ "name": "x" })).unwrap();
        assert_eq!(def.input_schema["type"], "object");
    }

    #[test]
    fn prompt_arguments_default_empty() {
        let def: PromptDef =
            serde_json::from_value(serde_json::json!({ "name": "greeting" })).unwrap();
        assert!(def.arguments.is_empty());
    }
}
