use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct McpResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One dispatched tool-call line and what came back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result: String,
}

fn text_or_blob(contents: &Value) -> Option<String> {
    contents
        .get("text")
        .or_else(|| contents.get("blob"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Decode the first content item of a `tools/call` result.
///
/// Text yields its text, images their base64 data, embedded resources
/// their text or blob.
pub fn decode_tool_result(result: &Value) -> Option<String> {
    let first = result.get("content")?.as_array()?.first()?;
    match first.get("type").and_then(Value::as_str) {
        Some("text") => first.get("text").and_then(Value::as_str).map(str::to_string),
        Some("image") | Some("audio") => {
            first.get("data").and_then(Value::as_str).map(str::to_string)
        }
        Some("resource") => first.get("resource").and_then(text_or_blob),
        _ => None,
    }
}

/// Decode the first `contents` item of a `resources/read` result.
pub fn decode_resource_result(result: &Value) -> Option<String> {
    result
        .get("contents")?
        .as_array()?
        .first()
        .and_then(text_or_blob)
}
