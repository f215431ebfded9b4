//! Priority levels for gated tasks

use serde::{Deserialize, Serialize};

/// Priority level of a gated task
///
/// Lower numbers are served first: `0` is critical. Levels need not be
/// contiguous and may be registered in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Priority(u32);

impl Priority {
    /// The first level served after every reset
    pub const CRITICAL: Priority = Priority(0);

    /// The lowest built-in level, used as the initial ceiling
    pub const SECONDARY: Priority = Priority(1);

    pub const fn new(level: u32) -> Self {
        Self(level)
    }

    pub const fn level(self) -> u32 {
        self.0
    }

    /// The next lower-priority level
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_critical(self) -> bool {
        self == Self::CRITICAL
    }
}

impl From<u32> for Priority {
    fn from(level: u32) -> Self {
        Self(level)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::CRITICAL => write!(f, "critical"),
            Self::SECONDARY => write!(f, "secondary"),
            Self(level) => write!(f, "p{}", level),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        match lowered.as_str() {
            "critical" => Ok(Self::CRITICAL),
            "secondary" => Ok(Self::SECONDARY),
            other => other
                .strip_prefix('p')
                .unwrap_or(other)
                .parse::<u32>()
                .map(Self)
                .map_err(|_| format!("Unknown priority: {}", s)),
        }
    }
}
