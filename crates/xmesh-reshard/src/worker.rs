// Worker interface: everything resharding asks of the process driving one
// host of a mesh, plus the records compiled tasks are made of.
//
// Workers own device buffers and the point-to-point primitives. This crate
// only decides what moves where and in which order.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xmesh_types::{BufferId, Dtype, IndexRange, Mesh, WorkerId};

use crate::error::{ReshardError, Result};
use crate::ids::TaskId;

// ── Task records ──────────────────────────────────────────────────────────────

/// One outgoing slice: which part of the local buffer goes to which peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTileSpec {
    /// Ranges within the sender's buffer.
    pub offset: Vec<IndexRange>,
    pub dst_rank: usize,
    pub dst_device: usize,
}

/// One incoming slice: where it lands in the receive buffer and who sends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvTileSpec {
    pub indices: Vec<IndexRange>,
    pub src_rank: usize,
    pub src_device: usize,
}

/// Everything one destination replica receives. The worker allocates the
/// buffer from `tile_shape` and `dtype` before the first slice arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvSpec {
    pub device: usize,
    pub tile_shape: Vec<usize>,
    pub dtype: Dtype,
    pub tiles: Vec<RecvTileSpec>,
}

/// Local allgather among devices of one worker: `tensor_slices[i]` is the
/// part of the buffer `device_ids[i]` already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllGatherSpec {
    pub device_ids: Vec<usize>,
    pub tensor_slices: Vec<Vec<IndexRange>>,
}

/// Timing of one replayed task list on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProfile {
    pub worker: WorkerId,
    pub task_id: TaskId,
    pub num_ops: usize,
    pub bytes: u64,
    pub elapsed_micros: u64,
}

/// Handle shared by both ends of a point-to-point communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommUid(pub Uuid);

impl CommUid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommUid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Worker trait ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait MeshWorker: Send + Sync {
    fn worker_id(&self) -> WorkerId;

    async fn put_resharding_send_task(
        &self,
        id: TaskId,
        tasks: Vec<SendTileSpec>,
        group_name: &str,
    ) -> Result<()>;

    async fn put_resharding_recv_task(
        &self,
        id: TaskId,
        tasks: Vec<RecvSpec>,
        group_name: &str,
    ) -> Result<()>;

    async fn put_resharding_allgather_task(&self, id: TaskId, tasks: Vec<AllGatherSpec>) -> Result<()>;

    /// Replay a send list. `buffer_ids[i]` feeds the i-th entry.
    async fn run_resharding_send_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> Result<()>;

    /// Replay a receive list. `buffer_ids[i]` names the buffer allocated for
    /// the i-th `RecvSpec`.
    async fn run_resharding_recv_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> Result<()>;

    /// `buffer_ids` is indexed by local device.
    async fn run_resharding_allgather_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> Result<()>;

    async fn profile_resharding_send_task(
        &self,
        id: TaskId,
        buffer_ids: Vec<BufferId>,
    ) -> Result<TaskProfile>;

    async fn profile_resharding_recv_task(
        &self,
        id: TaskId,
        buffer_ids: Vec<BufferId>,
    ) -> Result<TaskProfile>;

    async fn send_tile(
        &self,
        buffer: BufferId,
        offset: &[IndexRange],
        dst_rank: usize,
        dst_device: usize,
        group_name: &str,
    ) -> Result<()>;

    async fn recv_tile(
        &self,
        buffer: BufferId,
        device: usize,
        indices: &[IndexRange],
        src_rank: usize,
        src_device: usize,
        group_name: &str,
    ) -> Result<()>;

    async fn put_non_zero_buffer(
        &self,
        buffer: BufferId,
        device: usize,
        shape: &[usize],
        dtype: Dtype,
    ) -> Result<()>;

    async fn generate_nccl_uid(&self, group_name: &str) -> Result<CommUid>;

    async fn init_p2p_communicator(
        &self,
        group_name: &str,
        my_rank: usize,
        my_device: usize,
        peer_rank: usize,
        peer_device: usize,
        uid: CommUid,
    ) -> Result<()>;

    async fn init_collective_group(
        &self,
        world_size: usize,
        rank: usize,
        backend: &str,
        group_name: &str,
    ) -> Result<()>;

    /// Destroying a group this worker never joined is not an error.
    async fn destroy_collective_group(&self, group_name: &str) -> Result<()>;
}

// ── Physical mesh ─────────────────────────────────────────────────────────────

/// A mesh together with the worker driving each of its hosts.
#[derive(Clone)]
pub struct PhysicalMesh {
    pub mesh: Mesh,
    pub workers: Vec<Arc<dyn MeshWorker>>,
}

impl PhysicalMesh {
    pub fn new(mesh: Mesh, workers: Vec<Arc<dyn MeshWorker>>) -> Result<Self> {
        if workers.len() != mesh.num_hosts {
            return Err(ReshardError::Planning(format!(
                "mesh {} has {} hosts but {} workers",
                mesh.mesh_id,
                mesh.num_hosts,
                workers.len()
            )));
        }
        for (host, worker) in workers.iter().enumerate() {
            let expected = WorkerId { mesh_id: mesh.mesh_id, host };
            if worker.worker_id() != expected {
                return Err(ReshardError::Planning(format!(
                    "worker {} placed at {expected}",
                    worker.worker_id()
                )));
            }
        }
        Ok(Self { mesh, workers })
    }

    pub fn mesh_id(&self) -> usize {
        self.mesh.mesh_id
    }

    pub fn worker(&self, host: usize) -> Option<&Arc<dyn MeshWorker>> {
        self.workers.get(host)
    }
}

impl fmt::Debug for PhysicalMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<WorkerId> = self.workers.iter().map(|w| w.worker_id()).collect();
        f.debug_struct("PhysicalMesh")
            .field("mesh", &self.mesh)
            .field("workers", &ids)
            .finish()
    }
}
