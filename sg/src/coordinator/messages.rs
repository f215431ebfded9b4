//! Message types for the PriorityCoordinator

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{Priority, TaskId};

/// Notifications published to every subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CoordinatorEvent {
    /// The cursor moved forward to a new level
    CursorChanged { cursor: Priority },

    /// All queues were cleared and the cursor is back at the critical level
    Reset { cursor: Priority },
}

impl CoordinatorEvent {
    /// Cursor value carried by the event
    pub fn cursor(&self) -> Priority {
        match self {
            Self::CursorChanged { cursor } | Self::Reset { cursor } => *cursor,
        }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }
}

/// Identifies one entry in the coordinator's subscriber list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Receiving end of a coordinator subscription
///
/// Dropping the subscription detaches it; the coordinator prunes closed
/// entries on its next publish.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, rx: mpsc::UnboundedReceiver<CoordinatorEvent>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event
    ///
    /// Returns None once the coordinator has shut down or unsubscribed us.
    pub async fn recv(&mut self) -> Option<CoordinatorEvent> {
        let result = self.rx.recv().await;
        if result.is_none() {
            debug!(subscription = self.id.0, "Subscription::recv: channel closed");
        }
        result
    }

    /// Take an already-published event without waiting
    pub fn try_recv(&mut self) -> Option<CoordinatorEvent> {
        self.rx.try_recv().ok()
    }
}

/// Point-in-time view of the coordinator for tests and reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub cursor: Priority,
    pub ceiling: Priority,
    #[serde(rename = "known-priorities")]
    pub known_priorities: Vec<Priority>,
    pub pending: BTreeMap<Priority, Vec<TaskId>>,
    pub scheduled: Vec<TaskId>,
    pub fired: bool,
    pub subscribers: usize,
    #[serde(rename = "shut-down")]
    pub shut_down: bool,
}

impl CoordinatorSnapshot {
    /// Number of tasks still waiting to report, across all levels
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}
