//! Replays a scenario against a live coordinator

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::coordinator::{CoordinatorConfig, PriorityCoordinator};
use crate::domain::{Priority, TaskId};
use crate::task::{GatedTask, TaskState};

use super::model::{Scenario, TaskSpec};

/// Polling interval while waiting for the scenario to go quiet
const SETTLE_INTERVAL: Duration = Duration::from_millis(5);

/// One completion callback invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRecord {
    pub id: TaskId,
    pub priority: Priority,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    pub id: TaskId,
    pub message: String,
}

/// Everything observed while a scenario ran
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub completions: Vec<CompletionRecord>,
    pub faults: Vec<FaultRecord>,

    /// Every cursor value published, in order
    #[serde(rename = "cursor-trail")]
    pub cursor_trail: Vec<u32>,

    #[serde(rename = "final-cursor")]
    pub final_cursor: Priority,

    /// Whether the once-callback fired
    pub fired: bool,

    /// Gated tasks still waiting when the scenario went quiet
    pub stalled: Vec<TaskId>,
}

impl ScenarioReport {
    /// Completion order by id
    pub fn order(&self) -> Vec<&str> {
        self.completions.iter().map(|record| record.id.as_str()).collect()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Scenario: {}\n", self.scenario));
        out.push_str(&format!("Completion order: {}\n", self.order().join(", ")));

        let trail: Vec<String> = self.cursor_trail.iter().map(u32::to_string).collect();
        out.push_str(&format!("Cursor trail: {}\n", trail.join(" -> ")));
        out.push_str(&format!("Final cursor: {}\n", self.final_cursor.level()));
        out.push_str(&format!("Once-callback fired: {}\n", if self.fired { "yes" } else { "no" }));

        for fault in &self.faults {
            out.push_str(&format!("Fault in {}: {}\n", fault.id, fault.message));
        }
        if !self.stalled.is_empty() {
            let stalled: Vec<&str> = self.stalled.iter().map(TaskId::as_str).collect();
            out.push_str(&format!("Stalled: {}\n", stalled.join(", ")));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Action {
    Spawn,
    Retry,
    Teardown,
}

/// Drives one scenario on the current tokio runtime
pub struct ScenarioRunner {
    scenario: Scenario,
    config: CoordinatorConfig,
}

impl ScenarioRunner {
    pub fn new(scenario: Scenario, config: CoordinatorConfig) -> Self {
        debug!(name = %scenario.name, "ScenarioRunner::new: called");
        Self { scenario, config }
    }

    /// Run every timeline action, then wait for the coordinator to go quiet
    pub async fn run(&self) -> ScenarioReport {
        info!(name = %self.scenario.name, "Running scenario");
        let coordinator = PriorityCoordinator::new(self.config.clone());
        let mut events = coordinator.subscribe();

        let completions = Arc::new(Mutex::new(Vec::new()));
        let faults = Arc::new(Mutex::new(Vec::new()));

        coordinator.register_once_callback(|| info!("Once-callback fired"), self.scenario.fallback());

        let start = Instant::now();
        let mut live: BTreeMap<usize, GatedTask<String>> = BTreeMap::new();
        for (at, index, action) in self.timeline() {
            tokio::time::sleep_until(start + Duration::from_millis(at)).await;
            let spec = &self.scenario.tasks[index];
            debug!(at, task_id = %spec.id, ?action, "ScenarioRunner::run: action");

            match action {
                Action::Spawn => {
                    let task = Self::register(spec, &coordinator, &completions, &faults);
                    live.insert(index, task);
                }
                Action::Retry => {
                    if let Some(task) = live.get(&index) {
                        task.retry();
                    }
                }
                Action::Teardown => {
                    if let Some(task) = live.remove(&index) {
                        task.teardown();
                    }
                }
            }
        }

        Self::settle(&coordinator, &live).await;

        let mut cursor_trail = Vec::new();
        while let Some(event) = events.try_recv() {
            cursor_trail.push(event.cursor().level());
        }
        let stalled = live
            .values()
            .filter(|task| task.mode().is_gated() && task.state() != TaskState::Reported)
            .map(|task| task.id().clone())
            .collect();

        let report = ScenarioReport {
            scenario: self.scenario.name.clone(),
            completions: completions.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            faults: faults.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            cursor_trail,
            final_cursor: coordinator.cursor(),
            fired: coordinator.fired(),
            stalled,
        };
        coordinator.shutdown();
        info!(name = %self.scenario.name, completions = report.completions.len(), "Scenario finished");
        report
    }

    /// Actions ordered by time, then by declaration order
    fn timeline(&self) -> Vec<(u64, usize, Action)> {
        let mut timeline = Vec::new();
        for (index, spec) in self.scenario.tasks.iter().enumerate() {
            timeline.push((spec.spawn_after_ms, index, Action::Spawn));
            if let Some(at) = spec.retry_after_ms {
                timeline.push((at.max(spec.spawn_after_ms), index, Action::Retry));
            }
            if let Some(at) = spec.teardown_after_ms {
                timeline.push((at.max(spec.spawn_after_ms), index, Action::Teardown));
            }
        }
        timeline.sort_by_key(|(at, index, action)| (*at, *action, *index));
        timeline
    }

    fn register(
        spec: &TaskSpec,
        coordinator: &PriorityCoordinator,
        completions: &Arc<Mutex<Vec<CompletionRecord>>>,
        faults: &Arc<Mutex<Vec<FaultRecord>>>,
    ) -> GatedTask<String> {
        let completions = completions.clone();
        let faults = faults.clone();
        let id = spec.id.clone();
        let fault_id = spec.id.clone();
        let priority = spec.priority;

        let mut builder = GatedTask::builder(spec.id.clone(), spec.priority)
            .mode(spec.mode)
            .on_complete(move |content| {
                completions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(CompletionRecord {
                        id: id.clone(),
                        priority,
                        content,
                    });
            })
            .on_fault(move |e| {
                faults.lock().unwrap_or_else(PoisonError::into_inner).push(FaultRecord {
                    id: fault_id.clone(),
                    message: e.to_string(),
                });
            });

        if spec.has_fetch() {
            let delay = spec.delay();
            let content = spec.resolved_content();
            let failure = spec.fail.clone();
            builder = builder.fetch(move || {
                let content = content.clone();
                let failure = failure.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    match failure {
                        Some(message) => Err(eyre::eyre!(message)),
                        None => Ok(content),
                    }
                }
            });
        }
        builder.register(coordinator)
    }

    /// Wait until no fetch is in flight and no report is scheduled, twice in a row
    async fn settle(coordinator: &PriorityCoordinator, live: &BTreeMap<usize, GatedTask<String>>) {
        let mut quiet_checks = 0;
        while quiet_checks < 2 {
            tokio::time::sleep(SETTLE_INTERVAL).await;
            let busy = live.values().any(GatedTask::is_loading) || !coordinator.snapshot().scheduled.is_empty();
            quiet_checks = if busy { 0 } else { quiet_checks + 1 };
        }
        debug!(cursor = %coordinator.cursor(), "ScenarioRunner::settle: quiet");
    }
}
