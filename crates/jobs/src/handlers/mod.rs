//! Job bodies, one per [`JobType`](crate::JobType).
//!
//! Every handler publishes `start` with its arguments, does its work while
//! publishing `progress`, and returns. Terminal events belong to the
//! scheduler.

mod config;
mod context;
mod operations;
mod response;

use cadenza_config::AppConfig;
use cadenza_core::{Chunk, ChunkStream, ContextError, Error, OperationError};
use cadenza_mcp::McpManager;
use cadenza_operations::OperationRegistry;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::job::JobArgs;
use crate::process::ProcessManager;
use crate::prompter::{Prompter, append_history};
use crate::scheduler::JobScope;

/// Everything a job body can reach. One per runtime.
///
/// The std locks here are never held across an await.
pub struct Services {
    pub(crate) config: RwLock<AppConfig>,
    pub(crate) registry: Arc<OperationRegistry>,
    pub(crate) mcp: Arc<McpManager>,
    pub(crate) prompter: Mutex<Prompter>,
    /// Serializes history file appends so lines land in insertion order.
    history_writer: tokio::sync::Mutex<()>,
    pub(crate) processes: Arc<ProcessManager>,
}

impl Services {
    pub fn new(
        config: AppConfig,
        registry: Arc<OperationRegistry>,
        mcp: Arc<McpManager>,
        processes: Arc<ProcessManager>,
    ) -> Self {
        let mut prompter = Prompter::new(config.prompter.clone());
        prompter.set_mcp_prompts(mcp.get_tooling_prompt(), mcp.get_response_prompt());
        Self {
            config: RwLock::new(config),
            registry,
            mcp,
            prompter: Mutex::new(prompter),
            history_writer: tokio::sync::Mutex::new(()),
            processes,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.mcp
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    pub(crate) fn config(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config_mut(&self) -> RwLockWriteGuard<'_, AppConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn prompter(&self) -> MutexGuard<'_, Prompter> {
        self.prompter.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append history lines inserted since the last call to the history
    /// file, if one is configured.
    pub(crate) async fn persist_history(&self) -> Result<(), ContextError> {
        let _writer = self.history_writer.lock().await;
        let Some((path, lines)) = self.prompter().take_unwritten_history() else {
            return Ok(());
        };
        append_history(&path, &lines).await
    }

    /// Snapshot of the stored configuration.
    pub fn config_snapshot(&self) -> AppConfig {
        self.config().clone()
    }

    /// History lines as currently held by the prompter.
    pub fn history_lines(&self) -> Vec<String> {
        self.prompter().history().iter().map(|m| m.to_line()).collect()
    }
}

/// Run the body for `args`.
pub(crate) async fn dispatch(
    services: Arc<Services>,
    scope: JobScope,
    args: JobArgs,
) -> cadenza_core::Result<()> {
    let services = services.as_ref();
    let scope = &scope;
    match args {
        JobArgs::Response(args) => response::response(services, scope, args).await,
        JobArgs::ContextClear => context::clear(services, scope),
        JobArgs::ContextConfigure(update) => context::configure(services, scope, update),
        JobArgs::ContextRequestAdd(args) => context::request_add(services, scope, args).await,
        JobArgs::ContextConversationAddText(args) => {
            context::conversation_add_text(services, scope, args).await
        }
        JobArgs::ContextConversationAddAudio(args) => {
            context::conversation_add_audio(services, scope, args).await
        }
        JobArgs::ContextCustomRegister(args) => context::custom_register(services, scope, args),
        JobArgs::ContextCustomRemove(args) => context::custom_remove(services, scope, args),
        JobArgs::ContextCustomAdd(args) => context::custom_add(services, scope, args).await,
        JobArgs::OperationLoad(args) => operations::load(services, scope, args).await,
        JobArgs::OperationReloadFromConfig => operations::reload_from_config(services, scope).await,
        JobArgs::OperationUnload(args) => operations::unload(services, scope, args).await,
        JobArgs::OperationConfigure(args) => operations::configure(services, scope, args).await,
        JobArgs::OperationUse(args) => operations::use_operation(services, scope, args).await,
        JobArgs::ConfigLoad(args) => config::load(services, scope, args),
        JobArgs::ConfigUpdate(args) => config::update(services, scope, args),
        JobArgs::ConfigSave(args) => config::save(services, scope, args),
    }
}

/// Drain `stream`, concatenating the text of `field` across chunks.
pub(crate) async fn collect_text(mut stream: ChunkStream, field: &str) -> Result<String, OperationError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        if let Some(part) = chunk?.text(field) {
            text.push_str(part);
        }
    }
    Ok(text)
}

/// Publish every chunk of `stream` as a progress event.
pub(crate) async fn publish_chunks(scope: &JobScope, mut stream: ChunkStream) -> Result<(), Error> {
    while let Some(chunk) = stream.next().await {
        let chunk: Chunk = chunk?;
        scope.progress(chunk.to_json());
    }
    Ok(())
}
