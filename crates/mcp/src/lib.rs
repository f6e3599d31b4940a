//! Tool servers reached over the Model Context Protocol.
//!
//! A response job can ask a generator which tools to call before it
//! answers. [`McpManager`] owns one long-lived client per configured server,
//! builds the catalogue prompt the generator chooses from, parses its
//! line-per-call reply with [`grammar`], and dispatches each call.
//!
//! Servers may ask for a generation of their own mid-call
//! (`sampling/createMessage`). [`RegistrySampler`] answers those straight
//! from the operation registry.

pub mod client;
pub mod grammar;
pub mod manager;
pub mod prompt;
pub mod sampling;
pub mod server;
pub mod types;

pub use client::StdioClient;
pub use manager::McpManager;
pub use sampling::{RegistrySampler, SamplingHandler};
pub use server::ToolServer;
pub use types::{McpResource, McpResourceTemplate, McpTool, ToolCallRecord};
