use async_trait::async_trait;
use cadenza_core::ProtocolError;
use serde_json::Value;

use crate::types::{McpResource, McpResourceTemplate, McpTool};

/// A connected tool server.
///
/// Implemented by [`StdioClient`](crate::StdioClient) for subprocess
/// servers. Call and read results are the raw MCP result objects.
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>, ProtocolError>;

    async fn list_resources(&self) -> Result<Vec<McpResource>, ProtocolError>;

    async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>, ProtocolError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ProtocolError>;

    async fn read_resource(&self, uri: &str) -> Result<Value, ProtocolError>;

    /// Shut the server down. Calls after this fail.
    async fn close(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}
