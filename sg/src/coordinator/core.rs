//! PriorityCoordinator implementation

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::domain::{Priority, TaskId};

use super::config::CoordinatorConfig;
use super::messages::{CoordinatorEvent, CoordinatorSnapshot, Subscription, SubscriptionId};

/// Callback fired once when the cursor passes the ceiling
pub type OnceCallback = Arc<dyn Fn() + Send + Sync>;

/// Synchronous subscriber, called in subscription order outside the lock
pub type Listener = Arc<dyn Fn(&CoordinatorEvent) + Send + Sync>;

/// Report waiting in the completion queue
type DeferredReport = Box<dyn FnOnce() + Send>;

enum Subscriber {
    Channel(mpsc::UnboundedSender<CoordinatorEvent>),
    Listener(Listener),
}

struct QueuedReport {
    task_id: TaskId,
    report: DeferredReport,
}

/// Internal state protected by mutex
struct CoordinatorState {
    cursor: Priority,
    ceiling: Priority,
    known: BTreeSet<Priority>,
    pending: BTreeMap<Priority, BTreeSet<TaskId>>,

    /// Deferred reports in the order they were scheduled
    deferred: BTreeMap<u64, QueuedReport>,
    /// One outstanding deferred report per task
    deferred_index: HashMap<TaskId, u64>,
    next_deferred: u64,
    flusher: Option<AbortHandle>,

    once_callback: Option<OnceCallback>,
    fired: bool,
    fallback: Option<AbortHandle>,

    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    next_subscription: u64,
    /// Events still to be handed to listeners once the lock is released
    outbox: Vec<CoordinatorEvent>,

    /// Bumped by every reset
    epoch: u64,
    /// Cursor has moved past the ceiling
    exhausted: bool,
    shut_down: bool,
}

impl CoordinatorState {
    fn new(initial_ceiling: Priority) -> Self {
        Self {
            cursor: Priority::CRITICAL,
            ceiling: initial_ceiling,
            known: BTreeSet::new(),
            pending: BTreeMap::new(),
            deferred: BTreeMap::new(),
            deferred_index: HashMap::new(),
            next_deferred: 0,
            flusher: None,
            once_callback: None,
            fired: false,
            fallback: None,
            subscribers: BTreeMap::new(),
            next_subscription: 0,
            outbox: Vec::new(),
            epoch: 0,
            exhausted: false,
            shut_down: false,
        }
    }

    fn publish(&mut self, event: CoordinatorEvent) {
        debug!(?event, subscribers = self.subscribers.len(), "CoordinatorState::publish");
        let mut listeners = false;
        self.subscribers.retain(|_, subscriber| match subscriber {
            Subscriber::Channel(tx) => tx.send(event).is_ok(),
            Subscriber::Listener(_) => {
                listeners = true;
                true
            }
        });
        if listeners {
            self.outbox.push(event);
        }
    }

    fn listeners(&self) -> Vec<Listener> {
        self.subscribers
            .values()
            .filter_map(|subscriber| match subscriber {
                Subscriber::Listener(listener) => Some(listener.clone()),
                Subscriber::Channel(_) => None,
            })
            .collect()
    }

    fn level_drained(&self, priority: Priority) -> bool {
        self.pending.get(&priority).is_none_or(BTreeSet::is_empty)
    }

    fn has_pending(&self) -> bool {
        self.pending.values().any(|tasks| !tasks.is_empty())
    }

    /// Nothing is waiting at the cursor or any level before it
    fn drained_through_cursor(&self) -> bool {
        self.pending
            .range(..=self.cursor)
            .all(|(_, tasks)| tasks.is_empty())
    }

    fn dequeue(&mut self, priority: Priority, task_id: &TaskId) -> bool {
        let drained = match self.pending.get_mut(&priority) {
            Some(tasks) => {
                tasks.remove(task_id);
                tasks.is_empty()
            }
            None => true,
        };
        if drained {
            self.pending.remove(&priority);
        }
        drained
    }

    /// Gap-skip advance; returns true when the once-callback is due
    fn advance(&mut self, mut target: Priority) -> bool {
        loop {
            let past_ceiling = target > self.ceiling;

            if self.known.contains(&target) || past_ceiling {
                if target <= self.cursor {
                    debug!(%target, cursor = %self.cursor, "CoordinatorState::advance: not ahead of cursor, ignoring");
                    return false;
                }

                self.cursor = target;
                info!(cursor = %target, ceiling = %self.ceiling, "Cursor advanced");
                self.publish(CoordinatorEvent::CursorChanged { cursor: target });

                if past_ceiling {
                    self.exhausted = true;
                    return true;
                }

                // Every task at this level went away before the cursor arrived
                if !self.level_drained(target) {
                    return false;
                }
                debug!(%target, "CoordinatorState::advance: landed on abandoned level, continuing");
            } else {
                debug!(%target, "CoordinatorState::advance: level never registered, skipping");
            }

            if target.level() == u32::MAX {
                return false;
            }
            target = target.next();
        }
    }

    fn cancel_all_deferred(&mut self) {
        for queued in std::mem::take(&mut self.deferred).into_values() {
            debug!(task_id = %queued.task_id, "CoordinatorState::cancel_all_deferred: cancelling");
        }
        self.deferred_index.clear();
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
    }
}

struct Shared {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
}

/// Shared coordination point deciding when gated tasks may finish
///
/// Cloning is cheap; every clone refers to the same state. All mutations are
/// synchronous, so within one scheduling turn they are never interleaved.
/// Listeners hear events in subscription order and deferred reports run in
/// the order they were scheduled.
#[derive(Clone)]
pub struct PriorityCoordinator {
    shared: Arc<Shared>,
}

impl Default for PriorityCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

impl PriorityCoordinator {
    /// Create a new coordinator with the given configuration
    pub fn new(config: CoordinatorConfig) -> Self {
        debug!(?config, "PriorityCoordinator::new: called");
        let state = CoordinatorState::new(config.initial_ceiling);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Hand queued events to the listeners, then fire the once-callback
    fn settle(&self, fire_due: bool) {
        loop {
            let (events, listeners) = {
                let mut state = self.lock();
                if state.outbox.is_empty() {
                    break;
                }
                (std::mem::take(&mut state.outbox), state.listeners())
            };
            for event in &events {
                for listener in &listeners {
                    listener(event);
                }
            }
        }

        if fire_due {
            self.fire_once_if_due();
        }
    }

    // === Queue mutation ===

    /// Record a task as newly known at `priority`
    ///
    /// Returns false for blank ids and for ids already pending at that level;
    /// the caller must not start another run in that case.
    pub fn register_if_new(&self, priority: Priority, task_id: &TaskId) -> bool {
        debug!(%priority, %task_id, "PriorityCoordinator::register_if_new: called");
        let mut state = self.lock();

        if state.shut_down {
            debug!(%task_id, "PriorityCoordinator::register_if_new: coordinator shut down");
            return false;
        }
        if !task_id.is_present() {
            debug!("PriorityCoordinator::register_if_new: blank task id, refusing");
            return false;
        }
        if state.pending.get(&priority).is_some_and(|tasks| tasks.contains(task_id)) {
            debug!(%priority, %task_id, "PriorityCoordinator::register_if_new: already pending");
            return false;
        }

        state.known.insert(priority);
        state.ceiling = state.ceiling.max(priority);
        debug!(%priority, ceiling = %state.ceiling, "PriorityCoordinator::register_if_new: recorded");
        true
    }

    /// Add a task to the pending set of `priority`
    pub fn enqueue(&self, priority: Priority, task_id: &TaskId) {
        debug!(%priority, %task_id, "PriorityCoordinator::enqueue: called");
        let mut state = self.lock();
        if state.shut_down {
            return;
        }

        // Keep each id at a single level
        let stale: Vec<Priority> = state
            .pending
            .iter()
            .filter(|(level, tasks)| **level != priority && tasks.contains(task_id))
            .map(|(level, _)| *level)
            .collect();
        for level in stale {
            warn!(%task_id, from = %level, to = %priority, "Task moved between priorities");
            state.dequeue(level, task_id);
        }

        state.pending.entry(priority).or_default().insert(task_id.clone());
    }

    /// Remove a task from `priority`; returns true when the level is drained
    pub fn dequeue(&self, priority: Priority, task_id: &TaskId) -> bool {
        debug!(%priority, %task_id, "PriorityCoordinator::dequeue: called");
        let mut state = self.lock();
        if state.shut_down {
            return false;
        }
        state.dequeue(priority, task_id)
    }

    pub fn is_pending(&self, priority: Priority, task_id: &TaskId) -> bool {
        task_id.is_present()
            && self
                .lock()
                .pending
                .get(&priority)
                .is_some_and(|tasks| tasks.contains(task_id))
    }

    /// True whenever `register_if_new` would refuse the task
    pub fn is_known(&self, priority: Priority, task_id: &TaskId) -> bool {
        !task_id.is_present() || self.is_pending(priority, task_id)
    }

    // === Cursor ===

    /// Move the cursor to `target`, skipping levels nobody registered
    pub fn advance_to(&self, target: Priority) {
        debug!(%target, "PriorityCoordinator::advance_to: called");
        let fire_due = {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            state.advance(target)
        };
        self.settle(fire_due);
    }

    /// Report a task finished and advance the cursor if that drained the
    /// active levels
    ///
    /// A task that is not pending at `priority` is ignored, so a report left
    /// over from an earlier lifecycle cannot move the cursor.
    pub fn drain_and_advance(&self, priority: Priority, task_id: &TaskId) {
        debug!(%priority, %task_id, "PriorityCoordinator::drain_and_advance: called");
        let fire_due = {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            if !state.pending.get(&priority).is_some_and(|tasks| tasks.contains(task_id)) {
                debug!(%priority, %task_id, "PriorityCoordinator::drain_and_advance: not pending, ignoring");
                return;
            }

            let drained = state.dequeue(priority, task_id);
            if drained && priority <= state.cursor && !state.exhausted && state.drained_through_cursor() {
                let next = state.cursor.next();
                debug!(%priority, %next, "PriorityCoordinator::drain_and_advance: drained, advancing");
                state.advance(next)
            } else {
                debug!(%priority, drained, cursor = %state.cursor, "PriorityCoordinator::drain_and_advance: holding cursor");
                false
            }
        };
        self.settle(fire_due);
    }

    /// Restart an exhausted chain for a task registered above the cursor
    pub fn resume_if_exhausted(&self, priority: Priority) {
        let fire_due = {
            let mut state = self.lock();
            if state.shut_down || !state.exhausted || priority <= state.cursor {
                return;
            }
            info!(%priority, cursor = %state.cursor, "Resuming exhausted chain");
            state.exhausted = false;
            let next = state.cursor.next();
            state.advance(next)
        };
        self.settle(fire_due);
    }

    // === Deferred completions ===

    /// Queue the deferred report of a task, replacing any earlier one
    ///
    /// Reports run in the order they were queued, on the turn after they
    /// were scheduled. A replaced report never runs and the replacement
    /// goes to the back of the queue.
    pub fn schedule_completion<F>(&self, task_id: &TaskId, report: F)
    where
        F: FnOnce() + Send + 'static,
    {
        debug!(%task_id, "PriorityCoordinator::schedule_completion: called");
        let mut state = self.lock();
        if state.shut_down {
            debug!(%task_id, "PriorityCoordinator::schedule_completion: shut down, dropping report");
            return;
        }

        if let Some(previous) = state.deferred_index.remove(task_id) {
            debug!(%task_id, "PriorityCoordinator::schedule_completion: replacing earlier report");
            state.deferred.remove(&previous);
        }
        let seq = state.next_deferred;
        state.next_deferred += 1;
        state.deferred.insert(
            seq,
            QueuedReport {
                task_id: task_id.clone(),
                report: Box::new(report),
            },
        );
        state.deferred_index.insert(task_id.clone(), seq);

        if state.flusher.is_none() {
            state.flusher = self.arm_flusher();
        }
    }

    /// Spawn the single task that flushes the queue on the next turn
    fn arm_flusher(&self) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, deferred reports wait for flush_completions");
            return None;
        };

        let shared = self.downgrade();
        let flusher = runtime.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(coordinator) = Self::upgrade(&shared) {
                coordinator.flush_completions();
            }
        });
        Some(flusher.abort_handle())
    }

    /// Run every report queued so far, oldest first
    ///
    /// Reports queued while flushing wait for the next turn. Normally called
    /// by the flusher task; hosts without a runtime call it themselves.
    pub fn flush_completions(&self) {
        let batch_end = {
            let mut state = self.lock();
            state.flusher = None;
            state.next_deferred
        };
        debug!(batch_end, "PriorityCoordinator::flush_completions: called");

        loop {
            let queued = {
                let mut state = self.lock();
                if state.shut_down {
                    return;
                }
                match state.deferred.first_key_value() {
                    Some((seq, _)) if *seq < batch_end => {}
                    _ => break,
                }
                let Some((seq, queued)) = state.deferred.pop_first() else {
                    break;
                };
                if state.deferred_index.get(&queued.task_id) == Some(&seq) {
                    state.deferred_index.remove(&queued.task_id);
                }
                queued
            };

            debug!(task_id = %queued.task_id, "PriorityCoordinator::flush_completions: reporting");
            (queued.report)();
        }
    }

    /// Drop the deferred report of a task
    pub fn cancel_completion(&self, task_id: &TaskId) {
        debug!(%task_id, "PriorityCoordinator::cancel_completion: called");
        let mut state = self.lock();
        if let Some(seq) = state.deferred_index.remove(task_id) {
            state.deferred.remove(&seq);
        }
    }

    pub fn has_scheduled_completion(&self, task_id: &TaskId) -> bool {
        self.lock().deferred_index.contains_key(task_id)
    }

    // === Once-callback ===

    /// Register the callback fired when the cursor first passes the ceiling
    ///
    /// With a fallback delay (argument or config default) the callback is
    /// forced after that delay regardless of the cursor. Requires a tokio
    /// runtime for the fallback timer.
    pub fn register_once_callback<F>(&self, callback: F, fallback: Option<Duration>)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let fallback = fallback.or_else(|| self.config().fallback_timeout());
        debug!(?fallback, "PriorityCoordinator::register_once_callback: called");

        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        if state.once_callback.is_some() {
            warn!("Replacing previously registered once-callback");
        }
        state.once_callback = Some(Arc::new(callback));

        let Some(delay) = fallback else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(?delay, "No tokio runtime, fallback timer not armed");
            return;
        };

        let shared = self.downgrade();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = Self::upgrade(&shared) {
                debug!(?delay, "PriorityCoordinator: fallback timer elapsed");
                coordinator.fire_once_if_due();
            }
        });
        if let Some(previous) = state.fallback.replace(timer.abort_handle()) {
            previous.abort();
        }
    }

    /// Fire the once-callback unless it already fired this lifecycle
    pub fn fire_once_if_due(&self) {
        let callback = {
            let mut state = self.lock();
            if state.shut_down || state.fired {
                debug!(fired = state.fired, "PriorityCoordinator::fire_once_if_due: not due");
                return;
            }
            state.fired = true;
            state.once_callback.clone()
        };

        match callback {
            Some(callback) => {
                info!("Firing once-callback");
                callback();
            }
            None => debug!("PriorityCoordinator::fire_once_if_due: no callback registered"),
        }
    }

    // === Notification channel ===

    fn add_subscriber(&self, subscriber: Subscriber) -> SubscriptionId {
        let mut state = self.lock();
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;

        if state.shut_down {
            debug!(subscription = id.0, "PriorityCoordinator::add_subscriber: shut down, not attaching");
        } else {
            state.subscribers.insert(id, subscriber);
            debug!(subscription = id.0, "PriorityCoordinator::add_subscriber: attached");
        }
        id
    }

    /// Subscribe to cursor notifications through a channel
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_subscriber(Subscriber::Channel(tx));
        Subscription::new(id, rx)
    }

    /// Register a listener called synchronously for every event
    ///
    /// Listeners run after the coordinator lock is released, in the order
    /// they subscribed, so they may call back into the coordinator.
    pub fn listen<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CoordinatorEvent) + Send + Sync + 'static,
    {
        self.add_subscriber(Subscriber::Listener(Arc::new(listener)))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        debug!(subscription = id.0, "PriorityCoordinator::unsubscribe: called");
        self.lock().subscribers.remove(&id);
    }

    // === Lifecycle ===

    /// Clear every queue and return the cursor to the critical level
    ///
    /// Outstanding deferred reports and the fallback timer are cancelled
    /// first, so nothing from the previous lifecycle fires afterwards. Tasks
    /// that re-admit themselves on the reset event restart the chain: when
    /// nothing waits at the critical level the cursor moves on to the first
    /// level that has pending work.
    pub fn reset(&self) {
        debug!("PriorityCoordinator::reset: called");
        let epoch = {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }

            state.cancel_all_deferred();
            if let Some(timer) = state.fallback.take() {
                timer.abort();
            }

            state.pending.clear();
            state.known.clear();
            state.cursor = Priority::CRITICAL;
            state.ceiling = self.shared.config.initial_ceiling;
            state.fired = false;
            state.exhausted = false;
            state.epoch += 1;
            info!(epoch = state.epoch, "Coordinator reset");

            if self.shared.config.notify_on_reset {
                state.publish(CoordinatorEvent::Reset {
                    cursor: Priority::CRITICAL,
                });
            }
            state.epoch
        };
        self.settle(false);

        let fire_due = {
            let mut state = self.lock();
            if state.shut_down || state.epoch != epoch || !state.level_drained(state.cursor) || !state.has_pending() {
                return;
            }
            debug!("PriorityCoordinator::reset: critical level empty, restarting chain");
            let next = state.cursor.next();
            state.advance(next)
        };
        self.settle(fire_due);
    }

    /// Stop coordinating; every later operation is a no-op
    pub fn shutdown(&self) {
        debug!("PriorityCoordinator::shutdown: called");
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.cancel_all_deferred();
        if let Some(timer) = state.fallback.take() {
            timer.abort();
        }
        state.subscribers.clear();
        state.outbox.clear();
        state.shut_down = true;
        info!("Coordinator shut down");
    }

    // === Introspection ===

    pub fn cursor(&self) -> Priority {
        self.lock().cursor
    }

    pub fn ceiling(&self) -> Priority {
        self.lock().ceiling
    }

    /// Lifecycle counter, bumped by every reset
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn known_priorities(&self) -> Vec<Priority> {
        self.lock().known.iter().copied().collect()
    }

    pub fn pending_at(&self, priority: Priority) -> Vec<TaskId> {
        self.lock()
            .pending
            .get(&priority)
            .map(|tasks| tasks.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fired(&self) -> bool {
        self.lock().fired
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.lock();
        CoordinatorSnapshot {
            cursor: state.cursor,
            ceiling: state.ceiling,
            known_priorities: state.known.iter().copied().collect(),
            pending: state
                .pending
                .iter()
                .map(|(level, tasks)| (*level, tasks.iter().cloned().collect()))
                .collect(),
            scheduled: state.deferred.values().map(|queued| queued.task_id.clone()).collect(),
            fired: state.fired,
            subscribers: state.subscribers.len(),
            shut_down: state.shut_down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(name: &str) -> TaskId {
        TaskId::new(name)
    }

    fn p(level: u32) -> Priority {
        Priority::new(level)
    }

    fn register(coordinator: &PriorityCoordinator, level: u32, name: &str) {
        assert!(coordinator.register_if_new(p(level), &id(name)));
        coordinator.enqueue(p(level), &id(name));
    }

    fn drain_events(subscription: &mut Subscription) -> Vec<u32> {
        let mut cursors = Vec::new();
        while let Some(event) = subscription.try_recv() {
            cursors.push(event.cursor().level());
        }
        cursors
    }

    fn counting_callback() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        (calls, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_initial_state() {
        let coordinator = PriorityCoordinator::default();
        assert_eq!(coordinator.cursor(), Priority::CRITICAL);
        assert_eq!(coordinator.ceiling(), Priority::SECONDARY);
        assert!(coordinator.known_priorities().is_empty());
        assert!(!coordinator.fired());
    }

    #[test]
    fn test_register_if_new_updates_ceiling() {
        let coordinator = PriorityCoordinator::default();
        assert!(coordinator.register_if_new(p(2), &id("a")));
        assert_eq!(coordinator.ceiling(), p(2));
        assert!(coordinator.register_if_new(p(1), &id("b")));
        assert_eq!(coordinator.ceiling(), p(2));
        assert!(coordinator.register_if_new(p(3), &id("c")));
        assert_eq!(coordinator.ceiling(), p(3));
        assert_eq!(coordinator.known_priorities(), vec![p(1), p(2), p(3)]);
    }

    #[test]
    fn test_register_if_new_gates_duplicates_and_blank_ids() {
        let coordinator = PriorityCoordinator::default();
        assert!(coordinator.register_if_new(p(2), &id("uniqueP2Task1")));
        coordinator.enqueue(p(2), &id("uniqueP2Task1"));

        assert!(!coordinator.register_if_new(p(2), &id("uniqueP2Task1")));
        assert!(!coordinator.register_if_new(p(2), &id("")));
        assert!(coordinator.is_known(p(2), &id("uniqueP2Task1")));
        assert!(!coordinator.is_known(p(2), &id("other")));
        // Same id at a different level is a separate registration
        assert!(coordinator.register_if_new(p(3), &id("uniqueP2Task1")));
    }

    #[test]
    fn test_enqueue_is_set_like() {
        let coordinator = PriorityCoordinator::default();
        coordinator.enqueue(p(2), &id("uniqueP2Task1"));
        coordinator.enqueue(p(2), &id("uniqueP2Task1"));
        assert_eq!(coordinator.pending_at(p(2)), vec![id("uniqueP2Task1")]);

        coordinator.enqueue(p(2), &id("uniqueP2Task2"));
        assert_eq!(coordinator.pending_at(p(2)).len(), 2);
        assert!(coordinator.is_pending(p(2), &id("uniqueP2Task2")));
    }

    #[test]
    fn test_enqueue_keeps_id_at_one_level() {
        let coordinator = PriorityCoordinator::default();
        coordinator.enqueue(p(1), &id("moving"));
        coordinator.enqueue(p(4), &id("moving"));
        assert!(!coordinator.is_pending(p(1), &id("moving")));
        assert!(coordinator.is_pending(p(4), &id("moving")));
    }

    #[test]
    fn test_dequeue_reports_drain() {
        let coordinator = PriorityCoordinator::default();
        coordinator.enqueue(p(0), &id("uniqueP0Task1"));
        coordinator.enqueue(p(0), &id("uniqueP0Task2"));

        assert!(!coordinator.dequeue(p(0), &id("uniqueP0Task2")));
        assert!(!coordinator.is_pending(p(0), &id("uniqueP0Task2")));
        assert!(coordinator.dequeue(p(0), &id("uniqueP0Task1")));
        assert!(coordinator.pending_at(p(0)).is_empty());
        // Unknown level counts as drained
        assert!(coordinator.dequeue(p(9), &id("ghost")));
    }

    #[test]
    fn test_drain_and_advance_moves_cursor_once_level_is_empty() {
        let coordinator = PriorityCoordinator::default();
        let mut events = coordinator.subscribe();
        register(&coordinator, 0, "uniqueP0Task1");
        register(&coordinator, 0, "uniqueP0Task2");
        register(&coordinator, 1, "uniqueP1Task1");

        coordinator.drain_and_advance(p(0), &id("uniqueP0Task2"));
        assert!(drain_events(&mut events).is_empty());
        assert_eq!(coordinator.cursor(), p(0));

        coordinator.drain_and_advance(p(0), &id("uniqueP0Task1"));
        assert_eq!(drain_events(&mut events), vec![1]);
        assert_eq!(coordinator.cursor(), p(1));
    }

    #[test]
    fn test_gap_skip_visits_only_registered_levels() {
        let coordinator = PriorityCoordinator::default();
        let mut events = coordinator.subscribe();
        register(&coordinator, 0, "zero");
        register(&coordinator, 2, "two");
        register(&coordinator, 5, "five");

        coordinator.drain_and_advance(p(0), &id("zero"));
        assert_eq!(coordinator.cursor(), p(2));
        coordinator.drain_and_advance(p(2), &id("two"));
        assert_eq!(coordinator.cursor(), p(5));
        coordinator.drain_and_advance(p(5), &id("five"));

        // 6 is the "past the ceiling" terminal position
        assert_eq!(drain_events(&mut events), vec![2, 5, 6]);
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let coordinator = PriorityCoordinator::default();
        let mut events = coordinator.subscribe();
        register(&coordinator, 0, "a");
        register(&coordinator, 2, "b");
        register(&coordinator, 4, "c");

        coordinator.advance_to(p(4));
        assert_eq!(coordinator.cursor(), p(4));
        coordinator.advance_to(p(2));
        assert_eq!(coordinator.cursor(), p(4));
        assert_eq!(drain_events(&mut events), vec![4]);
    }

    #[test]
    fn test_late_lower_level_drain_does_not_skip_active_level() {
        let coordinator = PriorityCoordinator::default();
        register(&coordinator, 0, "a");
        register(&coordinator, 2, "b");
        register(&coordinator, 3, "c");
        coordinator.drain_and_advance(p(0), &id("a"));
        assert_eq!(coordinator.cursor(), p(2));

        // A task shows up late at level 1 while level 2 is still reporting
        register(&coordinator, 1, "late");
        coordinator.drain_and_advance(p(1), &id("late"));
        assert_eq!(coordinator.cursor(), p(2));

        coordinator.drain_and_advance(p(2), &id("b"));
        assert_eq!(coordinator.cursor(), p(3));
    }

    #[test]
    fn test_advance_skips_abandoned_level() {
        let coordinator = PriorityCoordinator::default();
        register(&coordinator, 0, "a");
        register(&coordinator, 1, "gone");
        register(&coordinator, 2, "b");

        // Level 1 loses its only task before the cursor reaches it
        assert!(coordinator.dequeue(p(1), &id("gone")));
        coordinator.drain_and_advance(p(0), &id("a"));
        assert_eq!(coordinator.cursor(), p(2));
    }

    #[test]
    fn test_once_callback_fires_once_past_ceiling() {
        let coordinator = PriorityCoordinator::default();
        let (calls, callback) = counting_callback();
        coordinator.register_once_callback(callback, None);
        register(&coordinator, 0, "uniqueP0Task1");
        register(&coordinator, 2, "uniqueP2Task2");

        coordinator.drain_and_advance(p(0), &id("uniqueP0Task1"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        coordinator.drain_and_advance(p(2), &id("uniqueP2Task2"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.fired());

        coordinator.advance_to(p(10));
        coordinator.fire_once_if_due();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_once_callback_does_not_invoke_immediately() {
        let coordinator = PriorityCoordinator::default();
        let (calls, callback) = counting_callback();
        coordinator.register_once_callback(callback, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!coordinator.fired());
    }

    #[test]
    fn test_fire_once_without_callback_still_marks_fired() {
        let coordinator = PriorityCoordinator::default();
        coordinator.fire_once_if_due();
        assert!(coordinator.fired());

        let (calls, callback) = counting_callback();
        coordinator.register_once_callback(callback, None);
        coordinator.fire_once_if_due();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_timer_forces_callback() {
        let coordinator = PriorityCoordinator::default();
        let (calls, callback) = counting_callback();
        register(&coordinator, 0, "stuck");
        coordinator.register_once_callback(callback, Some(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.fired());
        assert_eq!(coordinator.cursor(), p(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_timer_uses_config_default() {
        let coordinator = PriorityCoordinator::new(CoordinatorConfig {
            fallback_timeout_ms: Some(50),
            ..Default::default()
        });
        let (calls, callback) = counting_callback();
        coordinator.register_once_callback(callback, None);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn recording_report(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl FnOnce() + Send + 'static {
        let log = log.clone();
        move || log.lock().unwrap().push(name)
    }

    #[test]
    fn test_schedule_completion_replaces_and_cancels_previous() {
        let coordinator = PriorityCoordinator::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        coordinator.schedule_completion(&id("task"), recording_report(&log, "first"));
        coordinator.schedule_completion(&id("other"), recording_report(&log, "other"));
        coordinator.schedule_completion(&id("task"), recording_report(&log, "second"));
        assert!(coordinator.has_scheduled_completion(&id("task")));
        assert_eq!(coordinator.snapshot().scheduled, vec![id("other"), id("task")]);

        coordinator.cancel_completion(&id("other"));
        assert!(!coordinator.has_scheduled_completion(&id("other")));

        coordinator.flush_completions();
        assert_eq!(log.lock().unwrap().clone(), vec!["second"]);
        assert!(!coordinator.has_scheduled_completion(&id("task")));
    }

    #[tokio::test]
    async fn test_reports_run_in_schedule_order_on_next_turn() {
        let coordinator = PriorityCoordinator::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c", "d"] {
            coordinator.schedule_completion(&id(name), recording_report(&log, name));
        }
        assert!(log.lock().unwrap().is_empty());

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(log.lock().unwrap().clone(), vec!["a", "b", "c", "d"]);
        assert!(coordinator.snapshot().scheduled.is_empty());
    }

    #[tokio::test]
    async fn test_report_scheduled_while_flushing_waits_for_next_flush() {
        let coordinator = PriorityCoordinator::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let chained = coordinator.clone();
        let inner_log = log.clone();
        coordinator.schedule_completion(&id("outer"), move || {
            inner_log.lock().unwrap().push("outer");
            chained.schedule_completion(&id("inner"), recording_report(&inner_log, "inner"));
        });

        coordinator.flush_completions();
        assert_eq!(log.lock().unwrap().clone(), vec!["outer"]);
        assert!(coordinator.has_scheduled_completion(&id("inner")));

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(log.lock().unwrap().clone(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_listeners_hear_events_in_subscription_order() {
        let coordinator = PriorityCoordinator::default();
        let heard = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let heard = heard.clone();
            coordinator.listen(move |event| heard.lock().unwrap().push((name, event.cursor().level())));
        }
        register(&coordinator, 0, "a");
        register(&coordinator, 3, "b");

        coordinator.drain_and_advance(p(0), &id("a"));
        assert_eq!(
            heard.lock().unwrap().clone(),
            vec![("first", 3), ("second", 3), ("third", 3)]
        );
    }

    #[test]
    fn test_listener_may_call_back_into_coordinator() {
        let coordinator = PriorityCoordinator::default();
        register(&coordinator, 0, "a");
        register(&coordinator, 1, "b");
        register(&coordinator, 2, "c");

        // Every level reports as soon as the cursor reaches it
        let inner = coordinator.clone();
        coordinator.listen(move |event| {
            let cursor = event.cursor();
            for task in inner.pending_at(cursor) {
                inner.drain_and_advance(cursor, &task);
            }
        });

        coordinator.drain_and_advance(p(0), &id("a"));
        assert_eq!(coordinator.cursor(), p(3));
        assert!(coordinator.fired());
    }

    #[test]
    fn test_drain_of_task_not_pending_is_ignored() {
        let coordinator = PriorityCoordinator::default();
        let (calls, callback) = counting_callback();
        coordinator.register_once_callback(callback, None);

        // Nothing queued at the critical level: a leftover drain must not start the chain
        coordinator.drain_and_advance(p(0), &id("old"));
        assert_eq!(coordinator.cursor(), p(0));
        assert!(!coordinator.fired());

        register(&coordinator, 0, "crit");
        register(&coordinator, 1, "sec");
        coordinator.drain_and_advance(p(1), &id("ghost"));
        assert!(coordinator.is_pending(p(1), &id("sec")));
        assert_eq!(coordinator.cursor(), p(0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_bumps_epoch() {
        let coordinator = PriorityCoordinator::default();
        assert_eq!(coordinator.epoch(), 0);
        coordinator.reset();
        coordinator.reset();
        assert_eq!(coordinator.epoch(), 2);
    }

    #[test]
    fn test_reset_restarts_chain_for_readmitted_tasks() {
        let coordinator = PriorityCoordinator::default();
        register(&coordinator, 0, "first");
        register(&coordinator, 4, "waiting");
        coordinator.drain_and_advance(p(0), &id("first"));
        assert_eq!(coordinator.cursor(), p(4));

        // The unreported task re-admits itself when it hears the reset
        let inner = coordinator.clone();
        coordinator.listen(move |event| {
            if event.is_reset() {
                assert!(inner.register_if_new(p(4), &id("waiting")));
                inner.enqueue(p(4), &id("waiting"));
            }
        });

        coordinator.reset();
        assert_eq!(coordinator.cursor(), p(4));
        assert!(coordinator.is_pending(p(4), &id("waiting")));
        assert!(!coordinator.fired());
    }

    #[test]
    fn test_reset_without_readmissions_stays_at_critical() {
        let coordinator = PriorityCoordinator::default();
        register(&coordinator, 0, "a");
        register(&coordinator, 2, "b");
        coordinator.reset();
        assert_eq!(coordinator.cursor(), Priority::CRITICAL);
        assert!(!coordinator.fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_everything() {
        let coordinator = PriorityCoordinator::default();
        let mut events = coordinator.subscribe();
        let (calls, callback) = counting_callback();
        coordinator.register_once_callback(callback, Some(Duration::from_millis(100)));

        register(&coordinator, 0, "a");
        register(&coordinator, 2, "uniqueP2Task1");
        register(&coordinator, 5, "uniqueP5Task1");
        coordinator.drain_and_advance(p(0), &id("a"));
        assert_eq!(coordinator.cursor(), p(2));

        let log = Arc::new(Mutex::new(Vec::new()));
        coordinator.schedule_completion(&id("uniqueP2Task1"), recording_report(&log, "stale"));

        coordinator.reset();
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.cursor, Priority::CRITICAL);
        assert_eq!(snapshot.ceiling, Priority::SECONDARY);
        assert!(snapshot.known_priorities.is_empty());
        assert_eq!(snapshot.pending_count(), 0);
        assert!(snapshot.scheduled.is_empty());
        assert!(!snapshot.fired);
        assert_eq!(drain_events(&mut events), vec![2, 0]);
        coordinator.flush_completions();
        assert!(log.lock().unwrap().is_empty());

        // The fallback timer of the old lifecycle is gone
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_allows_once_callback_again() {
        let coordinator = PriorityCoordinator::default();
        let (calls, callback) = counting_callback();
        coordinator.register_once_callback(callback, None);

        coordinator.fire_once_if_due();
        coordinator.reset();
        register(&coordinator, 0, "a");
        coordinator.drain_and_advance(p(0), &id("a"));
        // Nothing registered at 1, so the cursor lands past the ceiling
        assert_eq!(coordinator.cursor(), p(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resume_if_exhausted_reaches_late_level() {
        let coordinator = PriorityCoordinator::default();
        register(&coordinator, 0, "a");
        coordinator.drain_and_advance(p(0), &id("a"));
        assert_eq!(coordinator.cursor(), p(2));

        register(&coordinator, 7, "late");
        coordinator.resume_if_exhausted(p(7));
        assert_eq!(coordinator.cursor(), p(7));
    }

    #[test]
    fn test_unsubscribe_and_dropped_subscription() {
        let coordinator = PriorityCoordinator::default();
        let kept = coordinator.subscribe();
        let dropped = coordinator.subscribe();
        assert_eq!(coordinator.subscriber_count(), 2);

        drop(dropped);
        coordinator.advance_to(p(5));
        assert_eq!(coordinator.subscriber_count(), 1);

        coordinator.unsubscribe(kept.id());
        assert_eq!(coordinator.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_makes_operations_no_ops() {
        let coordinator = PriorityCoordinator::default();
        let mut events = coordinator.subscribe();
        register(&coordinator, 0, "a");
        coordinator.shutdown();

        assert!(!coordinator.register_if_new(p(1), &id("b")));
        coordinator.enqueue(p(1), &id("b"));
        assert!(coordinator.pending_at(p(1)).is_empty());
        coordinator.drain_and_advance(p(0), &id("a"));
        assert_eq!(coordinator.cursor(), p(0));
        coordinator.reset();
        coordinator.fire_once_if_due();
        assert!(!coordinator.fired());
        assert!(coordinator.is_shut_down());
        assert!(events.recv().await.is_none());

        let log = Arc::new(Mutex::new(Vec::new()));
        coordinator.schedule_completion(&id("b"), recording_report(&log, "b"));
        assert!(!coordinator.has_scheduled_completion(&id("b")));
        coordinator.flush_completions();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(coordinator.listen(|_| {}), SubscriptionId(1));
        assert_eq!(coordinator.subscriber_count(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_cursor_visits_registered_levels_in_order(levels in proptest::collection::btree_set(0u32..40, 1..12)) {
                let coordinator = PriorityCoordinator::default();
                let mut events = coordinator.subscribe();
                for level in &levels {
                    register(&coordinator, *level, &format!("task-{}", level));
                }

                // Report whatever is pending at the cursor until the chain is exhausted
                let mut guard = 0;
                loop {
                    let cursor = coordinator.cursor();
                    let pending = coordinator.pending_at(cursor);
                    if pending.is_empty() {
                        break;
                    }
                    for task in pending {
                        coordinator.drain_and_advance(cursor, &task);
                    }
                    guard += 1;
                    prop_assert!(guard <= levels.len());
                }

                let visited = drain_events(&mut events);
                prop_assert!(visited.windows(2).all(|pair| pair[0] < pair[1]));

                let expected: Vec<u32> = levels.iter().copied().filter(|level| *level > 0).collect();
                let reached: Vec<u32> = visited.iter().copied().filter(|level| levels.contains(level)).collect();
                if levels.contains(&0) {
                    prop_assert_eq!(reached, expected);
                    prop_assert!(coordinator.fired());
                }
            }
        }
    }
}
