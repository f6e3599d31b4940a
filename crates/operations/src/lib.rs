//! Operation loading and composition for Cadenza.
//!
//! - [`BackendTable`]: `(kind, id)` → constructor, validated at startup
//! - [`OperationRegistry`]: role slots, lifecycle, and invocation
//! - [`FilterPipeline`]: depth-first streaming through a filter chain
//! - [`backends`]: the built-in backends registered by
//!   [`BackendTable::with_builtins`]

pub mod backends;
pub mod pipeline;
pub mod registry;
pub mod table;

pub use pipeline::FilterPipeline;
pub use registry::OperationRegistry;
pub use table::BackendTable;
