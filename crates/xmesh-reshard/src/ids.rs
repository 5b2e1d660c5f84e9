//! Identifiers for compiled task lists registered on workers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Task ids live in `[0, 2^60)` and wrap back to zero.
pub const TASK_ID_SPACE: u64 = 1 << 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Monotonic id generator shared by everything compiling against one set of
/// workers.
#[derive(Debug, Default)]
pub struct TaskIdSource {
    last: AtomicU64,
}

impl TaskIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call to [`next`](Self::next) returns `last + 1` (wrapped).
    pub fn starting_after(last: u64) -> Self {
        Self { last: AtomicU64::new(last % TASK_ID_SPACE) }
    }

    pub fn next(&self) -> TaskId {
        let bump = |c: u64| (c + 1) % TASK_ID_SPACE;
        let prev = self
            .last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(bump(c)))
            .unwrap_or_else(|c| c);
        TaskId(bump(prev))
    }
}
