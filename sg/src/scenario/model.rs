//! Scenario file model

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{Priority, TaskId};
use crate::task::TaskMode;

/// A declarative set of tasks replayed against one coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub name: String,

    pub description: Option<String>,

    /// Fallback delay for the once-callback, overriding the config default
    #[serde(rename = "fallback-ms")]
    pub fallback_ms: Option<u64>,

    pub tasks: Vec<TaskSpec>,
}

/// One task registration in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,

    pub priority: Priority,

    #[serde(default)]
    pub mode: TaskMode,

    /// Simulated fetch latency; without it the task has no fetch at all
    #[serde(rename = "delay-ms", default)]
    pub delay_ms: Option<u64>,

    /// Content the fetch resolves with
    #[serde(default)]
    pub content: Option<String>,

    /// Make the fetch fail with this message
    #[serde(default)]
    pub fail: Option<String>,

    /// Register this long after the scenario starts
    #[serde(rename = "spawn-after-ms", default)]
    pub spawn_after_ms: u64,

    /// Force a retry at this time
    #[serde(rename = "retry-after-ms", default)]
    pub retry_after_ms: Option<u64>,

    /// Tear the task down at this time
    #[serde(rename = "teardown-after-ms", default)]
    pub teardown_after_ms: Option<u64>,
}

impl TaskSpec {
    pub fn has_fetch(&self) -> bool {
        self.delay_ms.is_some() || self.content.is_some() || self.fail.is_some()
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.unwrap_or(0))
    }

    /// What a successful fetch yields
    pub fn resolved_content(&self) -> String {
        self.content.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// Problems `validate` finds without running the scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ScenarioIssue {
    /// Same id twice at one priority; the later one never runs on its own
    DuplicateId { id: TaskId, priority: Priority },

    BlankId { index: usize },

    /// Gated tasks exist but none at the critical level, so the cursor never moves
    NoCriticalTask,
}

impl std::fmt::Display for ScenarioIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId { id, priority } => {
                write!(f, "task '{}' registered twice at priority {}", id, priority)
            }
            Self::BlankId { index } => write!(f, "task #{} has a blank id", index),
            Self::NoCriticalTask => write!(f, "no gated task at the critical level, the chain never starts"),
        }
    }
}

impl Scenario {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Scenario::load: called");
        let content = fs::read_to_string(path).context(format!("Failed to read scenario {}", path.display()))?;
        let scenario = Self::parse(&content).context(format!("Failed to parse scenario {}", path.display()))?;
        info!(name = %scenario.name, tasks = scenario.tasks.len(), "Loaded scenario");
        Ok(scenario)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let scenario: Self = serde_yaml::from_str(content)?;
        Ok(scenario)
    }

    pub fn fallback(&self) -> Option<Duration> {
        self.fallback_ms.map(Duration::from_millis)
    }

    /// Distinct priorities used by gated tasks
    pub fn gated_levels(&self) -> BTreeSet<Priority> {
        self.tasks
            .iter()
            .filter(|task| task.mode.is_gated())
            .map(|task| task.priority)
            .collect()
    }

    pub fn validate(&self) -> Vec<ScenarioIssue> {
        debug!(name = %self.name, "Scenario::validate: called");
        let mut issues = Vec::new();
        let mut seen: BTreeMap<(Priority, &TaskId), usize> = BTreeMap::new();

        for (index, task) in self.tasks.iter().enumerate() {
            if !task.id.is_present() {
                issues.push(ScenarioIssue::BlankId { index });
                continue;
            }
            if !task.mode.is_gated() {
                continue;
            }
            let count = seen.entry((task.priority, &task.id)).or_default();
            *count += 1;
            if *count == 2 {
                issues.push(ScenarioIssue::DuplicateId {
                    id: task.id.clone(),
                    priority: task.priority,
                });
            }
        }

        let levels = self.gated_levels();
        if !levels.is_empty() && !levels.contains(&Priority::CRITICAL) {
            issues.push(ScenarioIssue::NoCriticalTask);
        }
        issues
    }
}
