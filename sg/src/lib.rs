//! seqgate - priority-gated completion ordering for async tasks
//!
//! Many independent async tasks are registered with a priority; each may
//! finish its work at any time, but completions are released strictly in
//! priority order. A shared coordinator tracks the active priority (the
//! cursor), skips levels nobody registered, and fires a one-shot callback
//! once every known level has drained.
//!
//! # Modules
//!
//! - [`coordinator`] - Priority cursor, pending queues and notifications
//! - [`task`] - Gated task state machine and builder
//! - [`domain`] - Priority and task id types
//! - [`scenario`] - Declarative scenarios replayed by the `sg` binary
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod scenario;
pub mod task;

pub use config::Config;
pub use coordinator::{CoordinatorConfig, CoordinatorEvent, CoordinatorSnapshot, PriorityCoordinator, Subscription};
pub use domain::{Priority, TaskId};
pub use task::{GatedTask, GatedTaskBuilder, PriorityStatus, RunHandle, TaskError, TaskMode, TaskState};
