//! Gated tasks
//!
//! A `GatedTask` wraps one unit of async work. Gated tasks wait until the
//! coordinator's cursor reaches their priority, run the fetch collaborator,
//! and report one scheduling turn later; the report drains their level and
//! lets the cursor move on.

mod builder;
mod core;
mod error;
mod types;

pub use builder::{CompletionFn, FaultFn, FetchFn, GatedTaskBuilder};
pub use core::{GatedTask, RunHandle};
pub use error::TaskError;
pub use types::{PriorityStatus, TaskMode, TaskState};
