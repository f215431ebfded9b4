//! Declarative scenarios replayed by the `sg` binary

mod model;
mod runner;

pub use model::{Scenario, ScenarioIssue, TaskSpec};
pub use runner::{CompletionRecord, FaultRecord, ScenarioReport, ScenarioRunner};
