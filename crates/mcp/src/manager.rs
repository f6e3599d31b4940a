use cadenza_config::McpServerConfig;
use cadenza_core::ProtocolError;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::client::StdioClient;
use crate::grammar::{ParsedCall, fill_template, parse_calls};
use crate::prompt::{TOOLING_PREAMBLE, result_descriptions, tool_catalogue};
use crate::sampling::SamplingHandler;
use crate::server::ToolServer;
use crate::types::{
    McpResource, McpResourceTemplate, McpTool, ToolCallRecord, decode_resource_result,
    decode_tool_result,
};

/// A registered server with its catalogue and prompt fragments.
struct LoadedServer {
    id: String,
    server: Arc<dyn ToolServer>,
    tools: Vec<McpTool>,
    resources: Vec<McpResource>,
    templates: Vec<McpResourceTemplate>,
    tool_prompt: String,
    response_prompt: String,
}

/// Where a parsed tool name resolved to.
enum Target {
    Tool(Arc<dyn ToolServer>, String),
    Resource(Arc<dyn ToolServer>, String),
    Template(Arc<dyn ToolServer>, String),
}

/// All loaded tool servers, in registration order.
pub struct McpManager {
    servers: Mutex<Vec<Arc<LoadedServer>>>,
    sampler: Option<Arc<dyn SamplingHandler>>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpManager {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(Vec::new()),
            sampler: None,
        }
    }

    /// Servers spawned by [`load_mcp`](Self::load_mcp) route sampling
    /// requests to `sampler`.
    pub fn with_sampler(sampler: Arc<dyn SamplingHandler>) -> Self {
        Self {
            servers: Mutex::new(Vec::new()),
            sampler: Some(sampler),
        }
    }

    fn servers(&self) -> MutexGuard<'_, Vec<Arc<LoadedServer>>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<LoadedServer>> {
        self.servers().clone()
    }

    /// Spawn a stdio server and register it under `config.id`.
    pub async fn load_mcp(&self, config: &McpServerConfig) -> Result<(), ProtocolError> {
        let client = StdioClient::connect(config, self.sampler.clone()).await?;
        self.add_server(&config.id, client).await
    }

    /// Register an already connected server.
    ///
    /// Its catalogue is listed once here. A list call the server rejects
    /// leaves that part of the catalogue empty. Reusing an id closes the
    /// old server and keeps its position.
    pub async fn add_server(&self, id: &str, server: Arc<dyn ToolServer>) -> Result<(), ProtocolError> {
        let tools = server.list_tools().await.unwrap_or_else(|e| {
            debug!(server = %id, error = %e, "No tools listed");
            Vec::new()
        });
        let resources = server.list_resources().await.unwrap_or_else(|e| {
            debug!(server = %id, error = %e, "No resources listed");
            Vec::new()
        });
        let templates = server.list_resource_templates().await.unwrap_or_else(|e| {
            debug!(server = %id, error = %e, "No resource templates listed");
            Vec::new()
        });

        let loaded = Arc::new(LoadedServer {
            id: id.to_string(),
            tool_prompt: tool_catalogue(&tools, &resources, &templates),
            response_prompt: result_descriptions(&tools, &resources, &templates),
            server,
            tools,
            resources,
            templates,
        });
        info!(
            server = %id,
            tools = loaded.tools.len(),
            resources = loaded.resources.len(),
            templates = loaded.templates.len(),
            "MCP server loaded"
        );

        let replaced = {
            let mut servers = self.servers();
            match servers.iter_mut().find(|s| s.id == id) {
                Some(slot) => Some(std::mem::replace(slot, loaded)),
                None => {
                    servers.push(loaded);
                    None
                }
            }
        };
        if let Some(replaced) = replaced {
            replaced.server.close().await?;
        }
        Ok(())
    }

    /// Close and forget one server. Unknown ids are ignored.
    pub async fn close_mcp(&self, id: &str) -> Result<(), ProtocolError> {
        let removed = {
            let mut servers = self.servers();
            servers
                .iter()
                .position(|s| s.id == id)
                .map(|at| servers.remove(at))
        };
        match removed {
            Some(removed) => {
                info!(server = %id, "Closing MCP server");
                removed.server.close().await
            }
            None => Ok(()),
        }
    }

    /// Close every server, returning the first failure.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let servers = std::mem::take(&mut *self.servers());
        let mut first_error = None;
        for loaded in servers {
            if let Err(e) = loaded.server.close().await {
                warn!(server = %loaded.id, error = %e, "Failed to close MCP server");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers().iter().map(|s| s.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers().is_empty()
    }

    /// System prompt for tool selection: the calling instructions followed
    /// by every server's catalogue.
    pub fn get_tooling_prompt(&self) -> String {
        self.servers()
            .iter()
            .fold(TOOLING_PREAMBLE.to_string(), |mut prompt, s| {
                prompt.push_str(&s.tool_prompt);
                prompt
            })
    }

    /// What each tool result means, for the responding generator.
    pub fn get_response_prompt(&self) -> String {
        self.servers()
            .iter()
            .map(|s| s.response_prompt.as_str())
            .collect()
    }

    /// Tools first, then resources, then templates, each across servers
    /// in registration order.
    fn resolve(servers: &[Arc<LoadedServer>], name: &str) -> Option<Target> {
        if let Some(s) = servers.iter().find(|s| s.tools.iter().any(|t| t.name == name)) {
            return Some(Target::Tool(s.server.clone(), name.to_string()));
        }
        for s in servers {
            if let Some(resource) = s.resources.iter().find(|r| r.name == name) {
                return Some(Target::Resource(s.server.clone(), resource.uri.clone()));
            }
        }
        for s in servers {
            if let Some(template) = s.templates.iter().find(|t| t.name == name) {
                return Some(Target::Template(s.server.clone(), template.uri_template.clone()));
            }
        }
        None
    }

    async fn dispatch(target: Target, arguments: Map<String, Value>) -> Result<Option<String>, ProtocolError> {
        match target {
            Target::Tool(server, name) => {
                let result = server.call_tool(&name, Value::Object(arguments)).await?;
                Ok(decode_tool_result(&result))
            }
            Target::Resource(server, uri) => {
                let result = server.read_resource(&uri).await?;
                Ok(decode_resource_result(&result))
            }
            Target::Template(server, uri_template) => {
                let uri = fill_template(&uri_template, &arguments)?;
                debug!(uri = %uri, "Reading templated resource");
                let result = server.read_resource(&uri).await?;
                Ok(decode_resource_result(&result))
            }
        }
    }

    /// Run every call in a generator's tool-selection output.
    ///
    /// Each line is independent: a malformed line or a failed call becomes
    /// a failure record and the rest still run. Unknown names and empty
    /// results produce no record.
    pub async fn use_tools(&self, tooling_response: &str) -> Vec<ToolCallRecord> {
        let servers = self.snapshot();
        let mut records = Vec::new();

        for ParsedCall { name, arguments } in parse_calls(tooling_response) {
            let outcome = match arguments {
                Err(e) => Err((Value::Null, e)),
                Ok(arguments) => match Self::resolve(&servers, &name) {
                    None => {
                        debug!(tool = %name, "No MCP server provides this tool");
                        continue;
                    }
                    Some(target) => {
                        let recorded = Value::Object(arguments.clone());
                        match Self::dispatch(target, arguments).await {
                            Ok(result) => Ok((recorded, result)),
                            Err(e) => Err((recorded, e)),
                        }
                    }
                },
            };

            let (arguments, result) = match outcome {
                Ok((arguments, Some(result))) => (arguments, result),
                Ok((_, None)) => continue,
                Err((arguments, e)) => {
                    warn!(tool = %name, error = %e, "MCP tool call failed");
                    (arguments, format!("Attempt to use MCP tool failed due to {e}"))
                }
            };
            if result.is_empty() {
                continue;
            }
            records.push(ToolCallRecord {
                tool_name: name,
                arguments,
                result,
            });
        }
        records
    }
}
