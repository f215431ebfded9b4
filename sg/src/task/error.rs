//! Task error types

use thiserror::Error;

use crate::domain::TaskId;

/// Faults a gated task can surface to its caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("fault while executing task fetch: {cause}")]
    Fetch { task_id: TaskId, cause: String },

    #[error("run of task {task_id} was superseded or torn down")]
    Cancelled { task_id: TaskId },

    #[error("run of task {task_id} panicked")]
    Panicked { task_id: TaskId },
}

impl TaskError {
    /// Wrap a failure reported by the fetch collaborator
    pub fn fetch(task_id: &TaskId, cause: &eyre::Report) -> Self {
        Self::Fetch {
            task_id: task_id.clone(),
            cause: format!("{:#}", cause),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Fetch { task_id, .. } | Self::Cancelled { task_id } | Self::Panicked { task_id } => task_id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
