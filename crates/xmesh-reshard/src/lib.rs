//! `xmesh-reshard`: cross-mesh resharding for pipeline-parallel training.
//!
//! When a stage on one device mesh produces a distributed array that a stage
//! on another mesh consumes, the array has to be re-laid-out across the
//! boundary. This crate plans that movement (which source replica sends which
//! slice to which destination device), balances the load over replicas, and
//! drives the transfer through [`MeshWorker`] handles. It never touches
//! device memory itself.
//!
//! # Flow
//!
//! ```text
//! stages + schedule
//!        │
//!        ▼
//! CrossMeshCommunicator ── tile mapping ── LoadBalancer
//!        │                                     │
//!        ▼                                     ▼
//! ReshardingRuntime ── CollectiveGroup ── compiled send/recv/allgather lists
//!        │
//!        ▼
//! ReshardingTask::execute  (immediate or prepared replay)
//! ```

pub mod collective;
pub mod communicator;
pub mod compiler;
pub mod error;
pub mod ids;
pub mod runtime;
pub mod strategy;
pub mod task;
pub mod task_spec;
pub mod tile;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use collective::{CollectiveGroup, GroupDeclaration, GroupRegistry};
pub use communicator::{rewrite_allgather_specs, CrossMeshCommunicator, VarSpecMap};
pub use compiler::{compile, AllGatherLayout, AllGatherPosition, CompiledTasks};
pub use error::{ReshardError, Result};
pub use ids::{TaskId, TaskIdSource, TASK_ID_SPACE};
pub use runtime::ReshardingRuntime;
pub use strategy::{LoadBalancer, LoadTracker};
pub use task::{ImmediateReshardingTask, PreparedReshardingTask, ReshardingTask, TaskContext};
pub use task_spec::{
    compute_mapping, AllGatherSlice, ReshardingStrategy, ReshardingTaskSpec, TileMapping,
};
pub use tile::{Tile, TileSlice, VirtualDistributedArray};
pub use transport::TaskRecord;
pub use worker::{
    AllGatherSpec, CommUid, MeshWorker, PhysicalMesh, RecvSpec, RecvTileSpec, SendTileSpec,
    TaskProfile,
};
