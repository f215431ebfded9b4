//! Domain types shared by the coordinator and gated tasks

mod id;
mod priority;

pub use id::TaskId;
pub use priority::Priority;
