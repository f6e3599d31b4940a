//! Error types for the Cadenza domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! wraps them and knows the stable classification string that job
//! `error` events carry.

use std::path::PathBuf;
use thiserror::Error;

use crate::operation::{OpKind, OpRole};

/// The top-level error type for all Cadenza operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Operation errors ---
    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    // --- Job errors ---
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    // --- Tool protocol errors ---
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Configuration errors ---
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // --- Conversation context errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Managed process errors ---
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable classification used in terminal `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Operation(e) => e.kind(),
            Error::Job(e) => e.kind(),
            Error::Protocol(_) => "mcp_protocol",
            Error::Config(e) => e.kind(),
            Error::Context(_) => "context_invalid",
            Error::Process(_) => "process_error",
            Error::Serialization(_) | Error::Internal(_) => "unknown",
        }
    }

    /// Whether this error represents a cancelled job rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Job(JobError::Cancelled { .. }))
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum OperationError {
    #[error("No operation of type {0}")]
    UnknownType(String),

    #[error("No operation of role {0}")]
    UnknownRole(String),

    #[error("No operation of type {kind} with id {id}")]
    UnknownId { kind: OpKind, id: String },

    #[error("Can not add already active {role} {id}")]
    Duplicate { role: OpRole, id: String },

    #[error("{}", unloaded_message(*role, id.as_deref()))]
    Unloaded { role: OpRole, id: Option<String> },

    #[error("Start called on already active {kind} operation {id}")]
    StartActive { kind: OpKind, id: String },

    #[error("Close called on already inactive {kind} operation {id}")]
    CloseInactive { kind: OpKind, id: String },

    #[error("Usage on inactive {kind} operation {id}")]
    UsedInactive { kind: OpKind, id: String },

    #[error("{kind} input chunk field '{field}' is invalid: {reason}")]
    InvalidChunk {
        kind: OpKind,
        field: String,
        reason: String,
    },

    #[error("Invalid configuration for {kind} operation {id}: {reason}")]
    InvalidConfig {
        kind: OpKind,
        id: String,
        reason: String,
    },

    #[error("{kind} operation {id} failed: {reason}")]
    Backend {
        kind: OpKind,
        id: String,
        reason: String,
    },
}

fn unloaded_message(role: OpRole, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("No operation {role} with id {id} loaded"),
        None => format!("No operation of type {role} loaded"),
    }
}

impl OperationError {
    pub fn kind(&self) -> &'static str {
        match self {
            OperationError::UnknownType(_) => "operation_unknown_type",
            OperationError::UnknownRole(_) => "operation_unknown_role",
            OperationError::UnknownId { .. } => "operation_unknown_id",
            OperationError::Duplicate { .. } => "operation_duplicate",
            OperationError::Unloaded { .. } => "operation_unloaded",
            OperationError::StartActive { .. } => "operation_active",
            OperationError::CloseInactive { .. } | OperationError::UsedInactive { .. } => {
                "operation_inactive"
            }
            OperationError::InvalidChunk { .. } => "operation_invalid_chunk",
            OperationError::InvalidConfig { .. } => "operation_invalid_config",
            OperationError::Backend { .. } => "operation_backend",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("Job {0} does not exist or already finished")]
    NotFound(String),

    #[error("Job {job_id} was cancelled{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        job_id: String,
        reason: Option<String>,
    },

    #[error("Unknown job type: {0}")]
    UnknownType(String),

    #[error("Invalid arguments for {job_type} job: {reason}")]
    InvalidArguments { job_type: String, reason: String },
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "job_not_found",
            JobError::Cancelled { .. } => "job_cancelled",
            JobError::UnknownType(_) => "job_unknown",
            JobError::InvalidArguments { .. } => "job_invalid_arguments",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Malformed tool call '{line}': {reason}")]
    MalformedToolCall { line: String, reason: String },

    #[error("Handshake with tool server {server} failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    #[error("Tool server transport failure: {0}")]
    Transport(String),

    #[error("Tool server returned error {code}: {message}")]
    Rpc { code: i64, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config field {0} does not exist")]
    UnknownField(String),

    #[error("Config file {} does not exist", .0.display())]
    UnknownFile(PathBuf),

    #[error("Failed to read config file at {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("Failed to write config file at {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("Custom context {0} is not registered")]
    UnknownContext(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("Failed to read prompt file {}: {reason}", path.display())]
    PromptFile { path: PathBuf, reason: String },

    #[error("Failed to append to history file {}: {reason}", path.display())]
    HistoryFile { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    #[error("Process {0} is not registered")]
    Unknown(String),

    #[error("Process {process} already has link {link}")]
    DuplicateLink { process: String, link: String },

    #[error("Process {process} has no link {link}")]
    MissingLink { process: String, link: String },

    #[error("Process {process} failed: {reason}")]
    Failed { process: String, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::UnknownField(_) => "config_unknown_field",
            ConfigError::UnknownFile(_) => "config_unknown_file",
            ConfigError::Read { .. }
            | ConfigError::Parse { .. }
            | ConfigError::Write { .. }
            | ConfigError::Validation(_) => "config_invalid",
        }
    }
}
