//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::Priority;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Ceiling the coordinator starts from and returns to on reset
    #[serde(rename = "initial-ceiling", default = "default_initial_ceiling")]
    pub initial_ceiling: Priority,

    /// Default safety-net delay for the once-callback, in milliseconds
    #[serde(rename = "fallback-timeout-ms", default)]
    pub fallback_timeout_ms: Option<u64>,

    /// Publish a reset event to subscribers after `reset()`
    #[serde(rename = "notify-on-reset", default = "default_notify_on_reset")]
    pub notify_on_reset: bool,
}

fn default_initial_ceiling() -> Priority {
    debug!("default_initial_ceiling: called");
    Priority::SECONDARY
}

fn default_notify_on_reset() -> bool {
    debug!("default_notify_on_reset: called");
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        debug!("CoordinatorConfig::default: called");
        Self {
            initial_ceiling: Priority::SECONDARY,
            fallback_timeout_ms: None,
            notify_on_reset: true,
        }
    }
}

impl CoordinatorConfig {
    /// Get the default fallback timeout as a Duration
    pub fn fallback_timeout(&self) -> Option<Duration> {
        debug!(fallback_timeout_ms = ?self.fallback_timeout_ms, "CoordinatorConfig::fallback_timeout: called");
        self.fallback_timeout_ms.map(Duration::from_millis)
    }
}
