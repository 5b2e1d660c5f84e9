// Recording worker for unit tests: accepts every call and logs it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use xmesh_types::{BufferId, Dtype, IndexRange, Mesh, WorkerId};

use crate::error::{ReshardError, Result};
use crate::ids::TaskId;
use crate::worker::{
    AllGatherSpec, CommUid, MeshWorker, PhysicalMesh, RecvSpec, SendTileSpec, TaskProfile,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PutSend { id: TaskId, tasks: Vec<SendTileSpec> },
    PutRecv { id: TaskId, tasks: Vec<RecvSpec> },
    PutAllGather { id: TaskId, tasks: Vec<AllGatherSpec> },
    RunSend { id: TaskId, buffers: Vec<BufferId> },
    RunRecv { id: TaskId, buffers: Vec<BufferId> },
    RunAllGather { id: TaskId, buffers: Vec<BufferId> },
    SendTile { buffer: BufferId, dst_rank: usize, dst_device: usize },
    RecvTile { buffer: BufferId, src_rank: usize, src_device: usize },
    PutBuffer { buffer: BufferId, device: usize, shape: Vec<usize> },
    GenerateUid,
    InitP2p { my_rank: usize, my_device: usize, peer_rank: usize, peer_device: usize },
    InitGroup { rank: usize, world_size: usize },
    DestroyGroup,
}

#[derive(Debug)]
pub struct RecordingWorker {
    id: WorkerId,
    calls: Mutex<Vec<Call>>,
    fail_runs: AtomicBool,
}

impl RecordingWorker {
    pub fn new(id: WorkerId) -> Self {
        Self { id, calls: Mutex::new(Vec::new()), fail_runs: AtomicBool::new(false) }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_runs(&self) {
        self.fail_runs.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self) -> Result<()> {
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(ReshardError::Worker(format!("{} is down", self.id)));
        }
        Ok(())
    }
}

pub fn physical_mesh(
    mesh_id: usize,
    num_hosts: usize,
    devices_per_host: usize,
) -> (PhysicalMesh, Vec<Arc<RecordingWorker>>) {
    let mesh = Mesh::new(mesh_id, num_hosts, devices_per_host).unwrap();
    let workers: Vec<Arc<RecordingWorker>> = mesh
        .worker_ids()
        .into_iter()
        .map(|id| Arc::new(RecordingWorker::new(id)))
        .collect();
    let handles = workers.iter().map(|w| w.clone() as Arc<dyn MeshWorker>).collect();
    (PhysicalMesh::new(mesh, handles).unwrap(), workers)
}

#[async_trait]
impl MeshWorker for RecordingWorker {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    async fn put_resharding_send_task(&self, id: TaskId, tasks: Vec<SendTileSpec>, _: &str) -> Result<()> {
        self.record(Call::PutSend { id, tasks });
        Ok(())
    }

    async fn put_resharding_recv_task(&self, id: TaskId, tasks: Vec<RecvSpec>, _: &str) -> Result<()> {
        self.record(Call::PutRecv { id, tasks });
        Ok(())
    }

    async fn put_resharding_allgather_task(&self, id: TaskId, tasks: Vec<AllGatherSpec>) -> Result<()> {
        self.record(Call::PutAllGather { id, tasks });
        Ok(())
    }

    async fn run_resharding_send_task(&self, id: TaskId, buffers: Vec<BufferId>) -> Result<()> {
        self.check()?;
        self.record(Call::RunSend { id, buffers });
        Ok(())
    }

    async fn run_resharding_recv_task(&self, id: TaskId, buffers: Vec<BufferId>) -> Result<()> {
        self.check()?;
        self.record(Call::RunRecv { id, buffers });
        Ok(())
    }

    async fn run_resharding_allgather_task(&self, id: TaskId, buffers: Vec<BufferId>) -> Result<()> {
        self.check()?;
        self.record(Call::RunAllGather { id, buffers });
        Ok(())
    }

    async fn profile_resharding_send_task(&self, id: TaskId, buffers: Vec<BufferId>) -> Result<TaskProfile> {
        let num_ops = buffers.len();
        self.run_resharding_send_task(id, buffers).await?;
        Ok(TaskProfile { worker: self.id, task_id: id, num_ops, bytes: 0, elapsed_micros: 0 })
    }

    async fn profile_resharding_recv_task(&self, id: TaskId, buffers: Vec<BufferId>) -> Result<TaskProfile> {
        let num_ops = buffers.len();
        self.run_resharding_recv_task(id, buffers).await?;
        Ok(TaskProfile { worker: self.id, task_id: id, num_ops, bytes: 0, elapsed_micros: 0 })
    }

    async fn send_tile(
        &self,
        buffer: BufferId,
        _: &[IndexRange],
        dst_rank: usize,
        dst_device: usize,
        _: &str,
    ) -> Result<()> {
        self.check()?;
        self.record(Call::SendTile { buffer, dst_rank, dst_device });
        Ok(())
    }

    async fn recv_tile(
        &self,
        buffer: BufferId,
        _: usize,
        _: &[IndexRange],
        src_rank: usize,
        src_device: usize,
        _: &str,
    ) -> Result<()> {
        self.check()?;
        self.record(Call::RecvTile { buffer, src_rank, src_device });
        Ok(())
    }

    async fn put_non_zero_buffer(&self, buffer: BufferId, device: usize, shape: &[usize], _: Dtype) -> Result<()> {
        self.record(Call::PutBuffer { buffer, device, shape: shape.to_vec() });
        Ok(())
    }

    async fn generate_nccl_uid(&self, _: &str) -> Result<CommUid> {
        self.record(Call::GenerateUid);
        Ok(CommUid::new())
    }

    async fn init_p2p_communicator(
        &self,
        _: &str,
        my_rank: usize,
        my_device: usize,
        peer_rank: usize,
        peer_device: usize,
        _: CommUid,
    ) -> Result<()> {
        self.record(Call::InitP2p { my_rank, my_device, peer_rank, peer_device });
        Ok(())
    }

    async fn init_collective_group(&self, world_size: usize, rank: usize, _: &str, _: &str) -> Result<()> {
        self.record(Call::InitGroup { rank, world_size });
        Ok(())
    }

    async fn destroy_collective_group(&self, _: &str) -> Result<()> {
        self.record(Call::DestroyGroup);
        Ok(())
    }
}
