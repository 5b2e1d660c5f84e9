//! A [`MeshWorker`] backed by host memory.
//!
//! Registered task lists are kept as encoded [`TaskRecord`]s, the same bytes
//! a remote worker would receive, and decoded again on every replay.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;
use xmesh_reshard::{
    AllGatherSpec, CommUid, MeshWorker, RecvSpec,
    SendTileSpec, TaskId, TaskProfile, TaskRecord,
};
use xmesh_types::{BufferId, Dtype, IndexRange, WorkerId};

use crate::error::LoopbackError;
use crate::fabric::{ChannelKey, Fabric};
use crate::tensor::HostTensor;

type ReshardResult<T> = xmesh_reshard::Result<T>;

#[derive(Debug)]
struct DeviceBuffer {
    device: usize,
    tensor: HostTensor,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    rank: usize,
    world_size: usize,
}

#[derive(Debug, Default)]
struct WorkerState {
    buffers: HashMap<BufferId, DeviceBuffer>,
    records: HashMap<TaskId, Vec<u8>>,
    groups: HashMap<String, Membership>,
    /// `(group, my_device, peer_rank, peer_device)`.
    communicators: HashSet<(String, usize, usize, usize)>,
}

#[derive(Debug)]
pub struct LoopbackWorker {
    id: WorkerId,
    num_devices: usize,
    fabric: Arc<Fabric>,
    state: Mutex<WorkerState>,
}

impl LoopbackWorker {
    pub fn new(id: WorkerId, num_devices: usize, fabric: Arc<Fabric>) -> Self {
        Self { id, num_devices, fabric, state: Mutex::new(WorkerState::default()) }
    }

    /// Place `tensor` on local `device` under `buffer`, replacing any
    /// previous contents.
    pub fn put_buffer(&self, buffer: BufferId, device: usize, tensor: HostTensor) -> Result<(), LoopbackError> {
        if device >= self.num_devices {
            return Err(LoopbackError::UnknownDevice { device, num_devices: self.num_devices });
        }
        self.lock().buffers.insert(buffer, DeviceBuffer { device, tensor });
        Ok(())
    }

    pub fn buffer(&self, buffer: BufferId) -> Option<HostTensor> {
        self.lock().buffers.get(&buffer).map(|b| b.tensor.clone())
    }

    pub fn free_buffer(&self, buffer: BufferId) -> bool {
        self.lock().buffers.remove(&buffer).is_some()
    }

    pub fn num_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn num_records(&self) -> usize {
        self.lock().records.len()
    }

    pub fn num_communicators(&self) -> usize {
        self.lock().communicators.len()
    }

    /// `(rank, world size)` in `group`, if joined.
    pub fn membership(&self, group: &str) -> Option<(usize, usize)> {
        self.lock().groups.get(group).map(|m| (m.rank, m.world_size))
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rank in `group`. A declared-only group is joined here on first use;
    /// its name lists member devices in rank order.
    fn rank_in(&self, group: &str) -> Result<usize, LoopbackError> {
        if let Some(m) = self.lock().groups.get(group) {
            return Ok(m.rank);
        }
        let mut members: Vec<WorkerId> = Vec::new();
        for device in group.split(',') {
            let worker = parse_worker(device).ok_or_else(|| LoopbackError::NotAMember(group.to_string()))?;
            if !members.contains(&worker) {
                members.push(worker);
            }
        }
        let rank = members
            .iter()
            .position(|w| *w == self.id)
            .ok_or_else(|| LoopbackError::NotAMember(group.to_string()))?;
        debug!(worker = %self.id, group, rank, "joined collective group on first use");
        self.lock()
            .groups
            .insert(group.to_string(), Membership { rank, world_size: members.len() });
        Ok(rank)
    }

    fn store_record(&self, record: TaskRecord) -> ReshardResult<()> {
        let bytes = record.to_bytes()?;
        self.lock().records.insert(record.id(), bytes);
        Ok(())
    }

    fn load_record(&self, id: TaskId) -> ReshardResult<TaskRecord> {
        let bytes = self
            .lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(LoopbackError::UnknownTask(id))?;
        TaskRecord::from_bytes(&bytes)
    }

    /// Returns the number of bytes sent.
    fn send_block(
        &self,
        buffer: BufferId,
        offset: &[IndexRange],
        dst_rank: usize,
        dst_device: usize,
        group: &str,
    ) -> Result<usize, LoopbackError> {
        let src_rank = self.rank_in(group)?;
        let (src_device, payload) = {
            let state = self.lock();
            let source = state.buffers.get(&buffer).ok_or(LoopbackError::UnknownBuffer(buffer))?;
            (source.device, source.tensor.read_block(offset)?)
        };
        let bytes = payload.len();
        let key = ChannelKey { group: group.to_string(), src_rank, src_device, dst_rank, dst_device };
        self.fabric.send(key, payload);
        Ok(bytes)
    }

    /// Returns the number of bytes received.
    async fn recv_block(
        &self,
        buffer: BufferId,
        device: usize,
        indices: &[IndexRange],
        src_rank: usize,
        src_device: usize,
        group: &str,
    ) -> Result<usize, LoopbackError> {
        let dst_rank = self.rank_in(group)?;
        let key = ChannelKey { group: group.to_string(), src_rank, src_device, dst_rank, dst_device: device };
        let payload = self.fabric.recv(&key).await;

        let mut state = self.lock();
        let target = state.buffers.get_mut(&buffer).ok_or(LoopbackError::UnknownBuffer(buffer))?;
        if target.device != device {
            return Err(LoopbackError::DeviceMismatch { expected: device, actual: target.device });
        }
        target.tensor.write_block(indices, &payload)?;
        Ok(payload.len())
    }

    /// `(ops, bytes)` moved.
    async fn replay_send(&self, id: TaskId, buffer_ids: &[BufferId]) -> ReshardResult<(usize, usize)> {
        let TaskRecord::Send { group, tasks, .. } = self.load_record(id)? else {
            return Err(LoopbackError::WrongTaskKind { id, expected: "send" }.into());
        };
        check_count(id, tasks.len(), buffer_ids.len())?;
        let mut bytes = 0;
        for (task, buffer) in tasks.iter().zip(buffer_ids) {
            bytes += self.send_block(*buffer, &task.offset, task.dst_rank, task.dst_device, &group)?;
        }
        Ok((tasks.len(), bytes))
    }

    async fn replay_recv(&self, id: TaskId, buffer_ids: &[BufferId]) -> ReshardResult<(usize, usize)> {
        let TaskRecord::Recv { group, tasks, .. } = self.load_record(id)? else {
            return Err(LoopbackError::WrongTaskKind { id, expected: "recv" }.into());
        };
        check_count(id, tasks.len(), buffer_ids.len())?;
        let mut ops = 0;
        let mut bytes = 0;
        for (spec, buffer) in tasks.iter().zip(buffer_ids) {
            self.put_buffer(*buffer, spec.device, HostTensor::filled(spec.tile_shape.clone(), spec.dtype, 1))?;
            for tile in &spec.tiles {
                bytes += self
                    .recv_block(*buffer, spec.device, &tile.indices, tile.src_rank, tile.src_device, &group)
                    .await?;
                ops += 1;
            }
        }
        Ok((ops, bytes))
    }

    fn allgather(&self, group: &AllGatherSpec, buffer_ids: &[BufferId]) -> Result<(), LoopbackError> {
        let mut state = self.lock();
        let mut members = Vec::with_capacity(group.device_ids.len());
        for device in &group.device_ids {
            let buffer = *buffer_ids
                .get(*device)
                .ok_or(LoopbackError::UnknownDevice { device: *device, num_devices: buffer_ids.len() })?;
            members.push(buffer);
        }

        let mut pieces = Vec::with_capacity(members.len());
        for (buffer, slice) in members.iter().zip(&group.tensor_slices) {
            let source = state.buffers.get(buffer).ok_or(LoopbackError::UnknownBuffer(*buffer))?;
            pieces.push(source.tensor.read_block(slice)?);
        }
        for (j, buffer) in members.iter().enumerate() {
            let target = state.buffers.get_mut(buffer).ok_or(LoopbackError::UnknownBuffer(*buffer))?;
            for (i, (piece, slice)) in pieces.iter().zip(&group.tensor_slices).enumerate() {
                if i != j {
                    target.tensor.write_block(slice, piece)?;
                }
            }
        }
        Ok(())
    }

    fn profile(&self, id: TaskId, started: Instant, (num_ops, bytes): (usize, usize)) -> TaskProfile {
        TaskProfile {
            worker: self.id,
            task_id: id,
            num_ops,
            bytes: bytes as u64,
            elapsed_micros: started.elapsed().as_micros() as u64,
        }
    }
}

fn check_count(id: TaskId, expected: usize, actual: usize) -> Result<(), LoopbackError> {
    if expected != actual {
        return Err(LoopbackError::BufferCountMismatch { id, expected, actual });
    }
    Ok(())
}

/// `m{mesh}:h{host}:d{device}` to its worker.
fn parse_worker(device: &str) -> Option<WorkerId> {
    let mut parts = device.split(':');
    let mesh_id = parts.next()?.strip_prefix('m')?.parse().ok()?;
    let host = parts.next()?.strip_prefix('h')?.parse().ok()?;
    Some(WorkerId { mesh_id, host })
}

#[async_trait]
impl MeshWorker for LoopbackWorker {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    async fn put_resharding_send_task(&self, id: TaskId, tasks: Vec<SendTileSpec>, group_name: &str) -> ReshardResult<()> {
        self.store_record(TaskRecord::Send { id, group: group_name.to_string(), tasks })
    }

    async fn put_resharding_recv_task(&self, id: TaskId, tasks: Vec<RecvSpec>, group_name: &str) -> ReshardResult<()> {
        self.store_record(TaskRecord::Recv { id, group: group_name.to_string(), tasks })
    }

    async fn put_resharding_allgather_task(&self, id: TaskId, tasks: Vec<AllGatherSpec>) -> ReshardResult<()> {
        self.store_record(TaskRecord::AllGather { id, tasks })
    }

    async fn run_resharding_send_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> ReshardResult<()> {
        self.replay_send(id, &buffer_ids).await.map(|_| ())
    }

    async fn run_resharding_recv_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> ReshardResult<()> {
        self.replay_recv(id, &buffer_ids).await.map(|_| ())
    }

    async fn run_resharding_allgather_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> ReshardResult<()> {
        let TaskRecord::AllGather { tasks, .. } = self.load_record(id)? else {
            return Err(LoopbackError::WrongTaskKind { id, expected: "allgather" }.into());
        };
        for group in &tasks {
            self.allgather(group, &buffer_ids)?;
        }
        Ok(())
    }

    async fn profile_resharding_send_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> ReshardResult<TaskProfile> {
        let started = Instant::now();
        let moved = self.replay_send(id, &buffer_ids).await?;
        Ok(self.profile(id, started, moved))
    }

    async fn profile_resharding_recv_task(&self, id: TaskId, buffer_ids: Vec<BufferId>) -> ReshardResult<TaskProfile> {
        let started = Instant::now();
        let moved = self.replay_recv(id, &buffer_ids).await?;
        Ok(self.profile(id, started, moved))
    }

    async fn send_tile(
        &self,
        buffer: BufferId,
        offset: &[IndexRange],
        dst_rank: usize,
        dst_device: usize,
        group_name: &str,
    ) -> ReshardResult<()> {
        self.send_block(buffer, offset, dst_rank, dst_device, group_name)?;
        Ok(())
    }

    async fn recv_tile(
        &self,
        buffer: BufferId,
        device: usize,
        indices: &[IndexRange],
        src_rank: usize,
        src_device: usize,
        group_name: &str,
    ) -> ReshardResult<()> {
        self.recv_block(buffer, device, indices, src_rank, src_device, group_name).await?;
        Ok(())
    }

    async fn put_non_zero_buffer(&self, buffer: BufferId, device: usize, shape: &[usize], dtype: Dtype) -> ReshardResult<()> {
        self.put_buffer(buffer, device, HostTensor::filled(shape.to_vec(), dtype, 1))?;
        Ok(())
    }

    async fn generate_nccl_uid(&self, _group_name: &str) -> ReshardResult<CommUid> {
        Ok(CommUid::new())
    }

    async fn init_p2p_communicator(
        &self,
        group_name: &str,
        my_rank: usize,
        my_device: usize,
        peer_rank: usize,
        peer_device: usize,
        uid: CommUid,
    ) -> ReshardResult<()> {
        debug!(worker = %self.id, group = group_name, my_rank, my_device, peer_rank, peer_device, %uid, "p2p communicator");
        self.lock()
            .communicators
            .insert((group_name.to_string(), my_device, peer_rank, peer_device));
        Ok(())
    }

    async fn init_collective_group(&self, world_size: usize, rank: usize, backend: &str, group_name: &str) -> ReshardResult<()> {
        debug!(worker = %self.id, group = group_name, rank, world_size, backend, "collective group joined");
        self.lock().groups.insert(group_name.to_string(), Membership { rank, world_size });
        Ok(())
    }

    async fn destroy_collective_group(&self, group_name: &str) -> ReshardResult<()> {
        let mut state = self.lock();
        state.groups.remove(group_name);
        state.communicators.retain(|(group, ..)| group != group_name);
        drop(state);
        self.fabric.close_group(group_name);
        Ok(())
    }
}
