use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a save worker retries a failed write before declaring the frame lost.
///
/// Retries happen in place on the worker that owns the frame; a frame is never
/// put back into the channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// One attempt only
    #[default]
    Never,

    /// Up to `attempts` tries with a constant pause between them
    Fixed { attempts: u32, delay_ms: u64 },

    /// Doubling pause starting at `base_ms`, capped at `max_ms`
    Exponential {
        base_ms: u64,
        max_ms: u64,
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// Total number of write attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Never => 1,
            Self::Fixed { attempts, .. } => (*attempts).max(1),
            Self::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Pause before retry number `retry` (1 = first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        match self {
            Self::Never => Duration::ZERO,
            Self::Fixed { delay_ms, .. } => Duration::from_millis(*delay_ms),
            Self::Exponential { base_ms, max_ms, .. } => {
                let shift = retry.saturating_sub(1).min(31);
                let delay = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}
