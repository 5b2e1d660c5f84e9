// Resharding configuration. Every field has a default so partial JSON
// documents deserialize cleanly.

use serde::{Deserialize, Serialize};

/// Which execution strategy resharding tasks are built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReshardingMode {
    /// Issue every send/receive directly from the control thread.
    Immediate,
    /// Register per-worker task lists once, then replay them by id.
    Prepared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshardConfig {
    /// Split under-sharded destinations further and finish them with a
    /// local allgather after the point-to-point step.
    pub use_scatter_gather: bool,

    /// Create one p2p communicator per (sender, receiver) device pair when a
    /// prepared task is compiled instead of on first use.
    pub eagerly_create_communicators: bool,

    /// Initialize collective groups on every member before returning
    /// instead of only declaring them.
    pub instantiate_groups_eagerly: bool,

    pub mode: ReshardingMode,

    /// Collective backend name passed to workers.
    pub backend: String,
}

impl Default for ReshardConfig {
    fn default() -> Self {
        Self {
            use_scatter_gather: true,
            eagerly_create_communicators: false,
            instantiate_groups_eagerly: true,
            mode: ReshardingMode::Prepared,
            backend: "nccl".to_string(),
        }
    }
}
