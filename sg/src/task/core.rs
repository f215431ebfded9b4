//! GatedTask state machine

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

use crate::coordinator::{CoordinatorEvent, PriorityCoordinator, SubscriptionId};
use crate::domain::{Priority, TaskId};

use super::builder::{CompletionFn, FaultFn, FetchFn, GatedTaskBuilder};
use super::error::TaskError;
use super::types::{PriorityStatus, TaskMode, TaskState};

type RunOutcome<T> = Result<Option<T>, TaskError>;

/// Whether a run participates in the coordinator's drain accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Reporting,
    /// User-triggered redo: delivers again, never drains
    Retry,
}

/// What a deferred report does once it runs
#[derive(Debug, Clone, Copy)]
struct Report {
    deliver: bool,
    drain: bool,
}

struct TaskSlot<T> {
    state: TaskState,
    last_result: Option<T>,
    last_error: Option<TaskError>,
    fulfilled: bool,

    /// Owns its id in the coordinator queues (false on an id collision)
    admitted: bool,
    destroyed: bool,

    /// Fetch currently in flight; a newer run aborts it
    in_flight: Option<(AbortHandle, RunKind)>,
    generation: u64,

    /// A scheduled report still has to drain our level
    owes_drain: bool,
}

struct TaskInner<T> {
    id: TaskId,
    priority: Priority,
    mode: TaskMode,
    coordinator: PriorityCoordinator,
    fetch: Option<FetchFn<T>>,
    on_complete: Option<CompletionFn<T>>,
    on_fault: Option<FaultFn>,
    slot: Mutex<TaskSlot<T>>,
}

impl<T> TaskInner<T>
where
    T: Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, TaskSlot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancelled(&self) -> TaskError {
        TaskError::Cancelled {
            task_id: self.id.clone(),
        }
    }

    /// Claim this task's place in the coordinator queues
    fn admit(&self) -> bool {
        if !self.mode.is_gated() {
            return true;
        }
        if self.coordinator.register_if_new(self.priority, &self.id) {
            self.coordinator.enqueue(self.priority, &self.id);
            self.coordinator.resume_if_exhausted(self.priority);
            true
        } else {
            debug!(task_id = %self.id, priority = %self.priority, "TaskInner::admit: id already pending, treating as running");
            false
        }
    }

    fn may_run(&self, slot: &TaskSlot<T>) -> bool {
        if !slot.admitted || slot.state == TaskState::Running {
            return false;
        }
        // Quick modes keep their mode for the task's whole life
        if !self.mode.is_gated() {
            return slot.state == TaskState::Idle;
        }
        self.coordinator.cursor() >= self.priority
            && self.coordinator.is_pending(self.priority, &self.id)
            && !self.coordinator.has_scheduled_completion(&self.id)
    }

    /// Start a run if the gate allows it (or unconditionally when forced)
    ///
    /// Runs without a fetch to await finish before returning, so their
    /// reports are queued in the order the runs were started.
    fn attempt_run(self: &Arc<Self>, force: bool, kind: RunKind) -> Option<RunHandle<T>> {
        let (kind, generation, epoch) = {
            let mut slot = self.lock();
            if slot.destroyed {
                debug!(task_id = %self.id, "TaskInner::attempt_run: torn down, ignoring");
                return None;
            }
            if !force && !self.may_run(&slot) {
                debug!(task_id = %self.id, state = ?slot.state, "TaskInner::attempt_run: not runnable yet");
                return None;
            }

            let mut kind = kind;
            if let Some((previous, previous_kind)) = slot.in_flight.take() {
                debug!(task_id = %self.id, "TaskInner::attempt_run: restarting in-flight fetch");
                previous.abort();
                // The abandoned run still owed a drain
                if previous_kind == RunKind::Reporting {
                    kind = RunKind::Reporting;
                }
            }
            slot.state = TaskState::Running;
            slot.generation += 1;
            (kind, slot.generation, self.coordinator.epoch())
        };
        info!(task_id = %self.id, priority = %self.priority, ?kind, epoch, "Task running");

        let skip_fetch = self.mode == TaskMode::Immediate && kind == RunKind::Reporting;
        let fetch = match &self.fetch {
            Some(fetch) if !skip_fetch => fetch,
            _ => {
                let outcome = self.finish_run(kind, generation, epoch, Ok(None));
                return Some(RunHandle::finished(self.id.clone(), outcome));
            }
        };

        debug!(task_id = %self.id, "TaskInner::attempt_run: invoking fetch");
        let future = fetch();

        let mut slot = self.lock();
        if slot.destroyed || slot.generation != generation {
            debug!(task_id = %self.id, "TaskInner::attempt_run: superseded before spawning");
            return Some(RunHandle::finished(self.id.clone(), Err(self.cancelled())));
        }
        let task = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = future.await.map(Some).map_err(|e| TaskError::fetch(&task.id, &e));
            task.finish_run(kind, generation, epoch, outcome)
        });
        slot.in_flight = Some((handle.abort_handle(), kind));
        Some(RunHandle::spawned(self.id.clone(), handle))
    }

    fn finish_run(self: &Arc<Self>, kind: RunKind, generation: u64, epoch: u64, outcome: RunOutcome<T>) -> RunOutcome<T> {
        {
            let mut slot = self.lock();
            if slot.destroyed || slot.generation != generation {
                debug!(task_id = %self.id, "TaskInner::finish_run: superseded, dropping outcome");
                return Err(self.cancelled());
            }
            slot.in_flight = None;

            if self.coordinator.epoch() != epoch {
                debug!(task_id = %self.id, epoch, "TaskInner::finish_run: started before a reset, dropping outcome");
                slot.state = TaskState::Idle;
                return Err(self.cancelled());
            }

            match &outcome {
                Ok(value) => {
                    slot.last_result = value.clone();
                    slot.last_error = None;
                    slot.fulfilled = true;
                }
                Err(e) => slot.last_error = Some(e.clone()),
            }
        }

        if let Err(e) = &outcome {
            error!(task_id = %self.id, error = %e, "Task fetch failed");
            if let Some(hook) = &self.on_fault {
                hook(e);
            }
        }

        // A faulted gated run still drains so its level cannot stall the chain
        let report = Report {
            deliver: outcome.is_ok(),
            drain: kind == RunKind::Reporting && self.mode.is_gated(),
        };
        if report.deliver || report.drain {
            self.schedule_report(report, epoch);
        } else {
            self.lock().state = TaskState::Idle;
        }

        outcome
    }

    /// Queue the report behind every report scheduled before it
    fn schedule_report(self: &Arc<Self>, mut report: Report, epoch: u64) {
        debug!(task_id = %self.id, ?report, "TaskInner::schedule_report: called");
        {
            // Replacing an unfired report must not lose its drain
            let mut slot = self.lock();
            report.drain |= slot.owes_drain;
            slot.owes_drain = report.drain;
        }
        let task = Arc::downgrade(self);
        self.coordinator.schedule_completion(&self.id, move || {
            if let Some(task) = task.upgrade() {
                task.report(report, epoch);
            }
        });
    }

    fn report(&self, report: Report, epoch: u64) {
        let result = {
            let mut slot = self.lock();
            if slot.destroyed {
                debug!(task_id = %self.id, "TaskInner::report: torn down, ignoring");
                return;
            }
            if self.coordinator.epoch() != epoch {
                debug!(task_id = %self.id, epoch, "TaskInner::report: scheduled before a reset, ignoring");
                return;
            }
            slot.owes_drain = false;
            slot.last_result.clone()
        };

        if report.deliver
            && let Some(callback) = &self.on_complete
        {
            callback(result);
        }
        if report.drain {
            self.coordinator.drain_and_advance(self.priority, &self.id);
        }

        let mut slot = self.lock();
        // A retry started meanwhile is still running
        if slot.in_flight.is_none() {
            slot.state = TaskState::Reported;
        }
        info!(task_id = %self.id, priority = %self.priority, "Task reported");
    }

    fn on_coordinator_change(self: &Arc<Self>, event: &CoordinatorEvent) {
        debug!(task_id = %self.id, ?event, "TaskInner::on_coordinator_change: called");
        if !self.mode.is_gated() {
            return;
        }

        if event.is_reset() {
            {
                let mut slot = self.lock();
                if slot.destroyed || slot.state == TaskState::Reported {
                    return;
                }
                // The reset dropped our queue entry and any scheduled report
                if let Some((in_flight, _)) = slot.in_flight.take() {
                    in_flight.abort();
                }
                slot.state = TaskState::Idle;
                slot.owes_drain = false;
                slot.admitted = false;
            }
            let admitted = self.admit();
            self.lock().admitted = admitted;
            self.attempt_run(false, RunKind::Reporting);
            return;
        }

        let cursor = event.cursor();
        if cursor == self.priority || cursor.is_critical() {
            self.attempt_run(false, RunKind::Reporting);
        }
    }

    fn teardown(&self) {
        let admitted = {
            let mut slot = self.lock();
            if slot.destroyed {
                return;
            }
            slot.destroyed = true;
            if let Some((in_flight, _)) = slot.in_flight.take() {
                in_flight.abort();
            }
            slot.admitted
        };

        if admitted {
            self.coordinator.cancel_completion(&self.id);
            if self.mode.is_gated() && self.coordinator.is_pending(self.priority, &self.id) {
                debug!(task_id = %self.id, "TaskInner::teardown: releasing pending entry");
                self.coordinator.drain_and_advance(self.priority, &self.id);
            }
        }
        info!(task_id = %self.id, "Task torn down");
    }
}

enum Run<T> {
    Finished(RunOutcome<T>),
    Spawned(JoinHandle<RunOutcome<T>>),
}

/// Handle to one run of a task
pub struct RunHandle<T> {
    task_id: TaskId,
    run: Run<T>,
}

impl<T> RunHandle<T> {
    fn finished(task_id: TaskId, outcome: RunOutcome<T>) -> Self {
        Self {
            task_id,
            run: Run::Finished(outcome),
        }
    }

    fn spawned(task_id: TaskId, handle: JoinHandle<RunOutcome<T>>) -> Self {
        Self {
            task_id,
            run: Run::Spawned(handle),
        }
    }

    /// Wait for the run to finish
    pub async fn outcome(self) -> RunOutcome<T> {
        let handle = match self.run {
            Run::Finished(outcome) => return outcome,
            Run::Spawned(handle) => handle,
        };
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(TaskError::Panicked { task_id: self.task_id }),
            Err(_) => Err(TaskError::Cancelled { task_id: self.task_id }),
        }
    }
}

/// One registered unit of work whose completion is gated by priority
///
/// Dropping the task tears it down: it leaves the pending queue, cancels
/// its scheduled report and stops listening to the coordinator.
pub struct GatedTask<T>
where
    T: Clone + Send + 'static,
{
    inner: Arc<TaskInner<T>>,
    subscription: SubscriptionId,
}

impl<T> GatedTask<T>
where
    T: Clone + Send + 'static,
{
    pub fn builder(id: impl Into<TaskId>, priority: impl Into<Priority>) -> GatedTaskBuilder<T> {
        GatedTaskBuilder::new(id, priority)
    }

    pub(crate) fn register(builder: GatedTaskBuilder<T>, coordinator: PriorityCoordinator) -> Self {
        let inner = Arc::new(TaskInner {
            id: builder.id,
            priority: builder.priority,
            mode: builder.mode,
            coordinator,
            fetch: builder.fetch,
            on_complete: builder.on_complete,
            on_fault: builder.on_fault,
            slot: Mutex::new(TaskSlot {
                state: TaskState::Idle,
                last_result: None,
                last_error: None,
                fulfilled: false,
                admitted: false,
                destroyed: false,
                in_flight: None,
                generation: 0,
                owes_drain: false,
            }),
        });

        let task = Arc::downgrade(&inner);
        let subscription = inner.coordinator.listen(move |event| {
            if let Some(task) = task.upgrade() {
                task.on_coordinator_change(event);
            }
        });

        let admitted = inner.admit();
        inner.lock().admitted = admitted;
        inner.attempt_run(false, RunKind::Reporting);

        Self { inner, subscription }
    }

    pub fn id(&self) -> &TaskId {
        &self.inner.id
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn mode(&self) -> TaskMode {
        self.inner.mode
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn last_result(&self) -> Option<T> {
        self.inner.lock().last_result.clone()
    }

    pub fn last_error(&self) -> Option<TaskError> {
        self.inner.lock().last_error.clone()
    }

    /// A fetch is in flight
    pub fn is_loading(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    /// At least one run produced a result
    pub fn is_fulfilled(&self) -> bool {
        self.inner.lock().fulfilled
    }

    /// Whether the task was admitted to the queue; false on an id collision
    pub fn is_admitted(&self) -> bool {
        self.inner.lock().admitted
    }

    pub fn priority_status(&self) -> PriorityStatus {
        let cursor = self.inner.coordinator.cursor();
        PriorityStatus {
            hit: self.inner.priority == cursor,
            mismatch: self.inner.priority > cursor,
        }
    }

    /// Check the gate and run if the cursor allows it
    pub fn attempt_run(&self) -> Option<RunHandle<T>> {
        self.inner.attempt_run(false, RunKind::Reporting)
    }

    /// Run again regardless of the cursor without touching drain accounting
    ///
    /// The fetch collaborator and the completion callback are invoked again;
    /// an in-flight fetch is abandoned in favor of the new one.
    pub fn retry(&self) -> Option<RunHandle<T>> {
        debug!(task_id = %self.inner.id, "GatedTask::retry: called");
        self.inner.attempt_run(true, RunKind::Retry)
    }

    /// Leave the queue and stop listening; later calls are no-ops
    pub fn teardown(&self) {
        self.inner.coordinator.unsubscribe(self.subscription);
        self.inner.teardown();
    }
}

impl<T> Drop for GatedTask<T>
where
    T: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.teardown();
    }
}
