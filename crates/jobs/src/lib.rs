//! Job orchestration for Cadenza.
//!
//! - [`JobScheduler`]: single-flight FIFO job loop with cancellation
//! - [`JobType`] / [`JobArgs`]: the job dispatch table and typed arguments
//! - [`Prompter`]: conversation history and prompt assembly
//! - [`ProcessManager`]: shared external processes serviced between jobs
//! - [`Runtime`]: the context object wiring all of it to the operation
//!   registry, tool servers and event bus

pub mod handlers;
pub mod job;
pub mod process;
pub mod prompter;
pub mod runtime;
pub mod scheduler;

pub use handlers::Services;
pub use job::{JobArgs, JobId, JobState, JobType};
pub use process::{ManagedProcess, ProcessManager};
pub use prompter::{Message, Prompter, PrompterUpdate};
pub use runtime::Runtime;
pub use scheduler::{JobScheduler, JobScope};
