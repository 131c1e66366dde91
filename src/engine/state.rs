use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline lifecycle states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Initializing,
    Running,
    /// Sources stopped, waiting for the channel to drain
    Draining,
    Stopped,
    Failed { reason: String },
}

impl PipelineState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        matches!(
            (self, target),
            (Idle, Initializing) |
            (Initializing, Running) |
            (Running, Draining) |
            (Draining, Stopped) |

            // Failure can interrupt any live state
            (Idle, Failed { .. }) |
            (Initializing, Failed { .. }) |
            (Running, Failed { .. }) |
            (Draining, Failed { .. })
        )
    }

    /// Get human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Initializing => "Initializing",
            Self::Running => "Running",
            Self::Draining => "Draining",
            Self::Stopped => "Stopped",
            Self::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "Failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}
