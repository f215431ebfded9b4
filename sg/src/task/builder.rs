//! Builder for gated task registrations

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::coordinator::PriorityCoordinator;
use crate::domain::{Priority, TaskId};

use super::core::GatedTask;
use super::error::TaskError;
use super::types::TaskMode;

/// External data-fetch collaborator
pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, eyre::Result<T>> + Send + Sync>;

/// Receives the latest result whenever the task reports
pub type CompletionFn<T> = Arc<dyn Fn(Option<T>) + Send + Sync>;

/// Host error-reporting hook for fetch faults
pub type FaultFn = Arc<dyn Fn(&TaskError) + Send + Sync>;

/// Collects the collaborators of a task before it is registered
pub struct GatedTaskBuilder<T> {
    pub(crate) id: TaskId,
    pub(crate) priority: Priority,
    pub(crate) mode: TaskMode,
    pub(crate) fetch: Option<FetchFn<T>>,
    pub(crate) on_complete: Option<CompletionFn<T>>,
    pub(crate) on_fault: Option<FaultFn>,
}

impl<T> GatedTaskBuilder<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(id: impl Into<TaskId>, priority: impl Into<Priority>) -> Self {
        Self {
            id: id.into(),
            priority: priority.into(),
            mode: TaskMode::Gated,
            fetch: None,
            on_complete: None,
            on_fault: None,
        }
    }

    pub fn mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    /// Async work to run once the task is allowed to; without it the task
    /// reports an empty result
    pub fn fetch<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
    {
        self.fetch = Some(Arc::new(move || fetch().boxed()));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_fault<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskError) + Send + Sync + 'static,
    {
        self.on_fault = Some(Arc::new(hook));
        self
    }

    /// Register with the coordinator and start gating
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(self, coordinator: &PriorityCoordinator) -> GatedTask<T> {
        debug!(task_id = %self.id, priority = %self.priority, mode = %self.mode, "GatedTaskBuilder::register: called");
        GatedTask::register(self, coordinator.clone())
    }
}
