//! Mode, state and status types for gated tasks

use serde::{Deserialize, Serialize};

/// How a task relates to the coordinator's cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskMode {
    /// Wait for the cursor to reach the task's priority, then drain it
    #[default]
    Gated,

    /// Skip the fetch collaborator and report an empty result right away
    Immediate,

    /// Fetch right away, ignoring the cursor
    OutOfOrder,
}

impl TaskMode {
    /// Gated tasks are the only ones that queue and drain
    pub fn is_gated(self) -> bool {
        self == Self::Gated
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gated => write!(f, "gated"),
            Self::Immediate => write!(f, "immediate"),
            Self::OutOfOrder => write!(f, "out-of-order"),
        }
    }
}

/// Lifecycle of one task registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Idle,
    Running,
    Reported,
}

/// Where a task sits relative to the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriorityStatus {
    /// The cursor is exactly at the task's priority
    pub hit: bool,

    /// The cursor has not reached the task's priority yet
    pub mismatch: bool,
}
