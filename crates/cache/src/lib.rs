//! Block-cache coordination contract.
//!
//! The renderer does not load image blocks itself; it only tells the cache
//! when a new frame (or dirty-interval batch) starts and how much IO time a
//! frame may spend. Everything else about fetching is the cache's business.

use serde::{Deserialize, Serialize};

/// Per-frame IO time budget, in nanoseconds: how long a whole frame may
/// spend waiting on block IO, and how long a single block load may take
/// before the source falls back to placeholder data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoTimeBudget {
    pub frame_nanos: u64,
    pub block_nanos: u64,
}

impl Default for IoTimeBudget {
    fn default() -> Self {
        Self {
            frame_nanos: 100_000_000,
            block_nanos: 10_000_000,
        }
    }
}

/// External coordinator of block fetches.
///
/// `prepare_next_frame` is called exactly once per new frame or new
/// dirty-interval batch (never per finer refinement pass within one batch)
/// so the cache can age its queues and re-prioritize pending fetches.
pub trait CacheControl: Send + Sync {
    fn prepare_next_frame(&self);

    /// Reset the IO budget for the upcoming render pass. Called at projector
    /// creation.
    fn reset_io_time_budget(&self, budget: IoTimeBudget);
}

/// Cache control for setups without asynchronous block loading.
#[derive(Debug, Default)]
pub struct NoopCacheControl;

impl CacheControl for NoopCacheControl {
    fn prepare_next_frame(&self) {}

    fn reset_io_time_budget(&self, _budget: IoTimeBudget) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_is_100ms_frame_10ms_block() {
        let budget = IoTimeBudget::default();
        assert_eq!(budget.frame_nanos, 100_000_000);
        assert_eq!(budget.block_nanos, 10_000_000);
    }
}
