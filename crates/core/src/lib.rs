//! # Cadenza Core
//!
//! Domain types, traits, and error definitions for the Cadenza response
//! pipeline engine. This crate has **no I/O of its own**: it defines the
//! model that the registry, tool protocol, and scheduler crates build on.
//!
//! ## Design Philosophy
//!
//! Every pluggable capability is a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping backends via configuration
//! - Easy testing with scripted mock backends
//! - Clean dependency graph (all crates depend inward on core)

pub mod chunk;
pub mod error;
pub mod event;
pub mod operation;

// Re-export key types at crate root for ergonomics
pub use chunk::{Chunk, Value};
pub use error::{
    ConfigError, ContextError, Error, JobError, OperationError, ProcessError, ProtocolError, Result,
};
pub use event::{Event, EventBus, EventHandler, EventPhase, SubscriptionId};
pub use operation::{Backend, ChunkStream, OpConfig, OpKind, OpRole, Operation};
