//! Executable resharding tasks.
//!
//! Two strategies share one [`TaskContext`]:
//!
//! - **Immediate**: the caller drives every transfer, one destination replica
//!   at a time. Nothing is registered on workers ahead of time.
//! - **Prepared**: per-worker task lists are compiled and registered once,
//!   then every execution replays them with fresh buffer ids.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info};
use xmesh_types::{
    BufferId, BufferRef, DeviceId, DistributedArray, IndexRange, Mesh, ShardingSpec, WorkerId,
};

use crate::collective::CollectiveGroup;
use crate::compiler::{compile, CompiledTasks};
use crate::error::{ReshardError, Result};
use crate::ids::{TaskId, TaskIdSource};
use crate::task_spec::{ReshardingTaskSpec, TileMapping};
use crate::tile::VirtualDistributedArray;
use crate::worker::TaskProfile;

// ── Context ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub spec: Arc<ReshardingTaskSpec>,
    pub group: Arc<CollectiveGroup>,
    pub src_mesh: Mesh,
    pub dst_mesh: Mesh,
}

impl TaskContext {
    pub fn new(spec: Arc<ReshardingTaskSpec>, group: Arc<CollectiveGroup>) -> Result<Self> {
        let src_mesh = *spec.src().mesh();
        let dst_mesh = *spec.dst().mesh();
        for (expected, actual) in [(group.src_mesh(), &src_mesh), (group.dst_mesh(), &dst_mesh)] {
            if expected != actual {
                return Err(ReshardError::MeshMismatch {
                    expected: expected.mesh_id,
                    actual: actual.mesh_id,
                });
            }
        }
        Ok(Self { spec, group, src_mesh, dst_mesh })
    }

    fn check_source(&self, src_array: &DistributedArray) -> Result<()> {
        if src_array.mesh_id != self.src_mesh.mesh_id {
            return Err(ReshardError::MeshMismatch {
                expected: self.src_mesh.mesh_id,
                actual: src_array.mesh_id,
            });
        }
        Ok(())
    }

    /// Buffer of `src_array` living on `device`.
    fn source_buffer(&self, src_array: &DistributedArray, device: DeviceId) -> Result<BufferRef> {
        let flat = self.spec.src().device_flat_index(device)?;
        src_array.buffers.get(flat).copied().ok_or_else(|| {
            ReshardError::Planning(format!(
                "source array has {} buffers, none for {device}",
                src_array.num_buffers()
            ))
        })
    }

    /// Order `buffers` by destination device and wrap them as an array.
    fn assemble(
        &self,
        mut buffers: HashMap<DeviceId, BufferRef>,
        sharding_spec: ShardingSpec,
        indices: Vec<Vec<IndexRange>>,
    ) -> Result<DistributedArray> {
        let ordered = self
            .dst_mesh
            .device_ids()
            .into_iter()
            .map(|device| {
                buffers
                    .remove(&device)
                    .ok_or_else(|| ReshardError::Planning(format!("no buffer produced for {device}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DistributedArray::new(
            self.dst_mesh.mesh_id,
            self.spec.aval().clone(),
            sharding_spec,
            ordered,
            indices,
        ))
    }
}

// ── Immediate ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ImmediateReshardingTask {
    ctx: TaskContext,
}

impl ImmediateReshardingTask {
    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Move every slice with direct send/receive calls. The result carries
    /// the point-to-point destination sharding.
    pub async fn do_immediate(&self, src_array: &DistributedArray) -> Result<DistributedArray> {
        self.ctx.check_source(src_array)?;
        let spec = &self.ctx.spec;
        let mapping = spec.dst_tile_to_src_tiles_map()?;
        let strategy = spec.strategy()?;

        let mut buffers = HashMap::new();
        for (tile_index, tile_mapping) in mapping.iter().enumerate() {
            let tile_plan = strategy.tile_plan(tile_index);
            for (replica, receiver) in tile_mapping.dst_tile.replica_devices.iter().enumerate() {
                let senders = tile_plan.get(replica).ok_or_else(|| {
                    ReshardError::Planning(format!("no plan for tile {tile_index}, replica {replica}"))
                })?;
                let buffer = self.receive_tile(src_array, tile_mapping, senders, *receiver).await?;
                buffers.insert(*receiver, buffer);
            }
        }
        self.ctx.assemble(buffers, spec.dst_sharding_spec().clone(), spec.dst_indices())
    }

    /// All slices of one destination tile into one receiver, one at a time.
    async fn receive_tile(
        &self,
        src_array: &DistributedArray,
        tile_mapping: &TileMapping,
        senders: &[DeviceId],
        receiver: DeviceId,
    ) -> Result<BufferRef> {
        let group = &self.ctx.group;
        let group_name = group.name();
        let receiver_worker = group.device_worker(receiver)?;
        let (recv_rank, recv_device) = group.device_rank(receiver)?;

        let result = BufferRef::new(receiver, self.ctx.spec.aval().dtype);
        receiver_worker
            .put_non_zero_buffer(result.id, recv_device, &tile_mapping.dst_tile.tile_shape(), result.dtype)
            .await?;

        for ((slice, placement), sender) in tile_mapping
            .src_slices
            .iter()
            .zip(&tile_mapping.indices_in_dst)
            .zip(senders)
        {
            let send_buffer = self.ctx.source_buffer(src_array, *sender)?;
            let sender_worker = group.device_worker(*sender)?;
            let (send_rank, send_device) = group.device_rank(*sender)?;

            let send = sender_worker.send_tile(send_buffer.id, &slice.offset, recv_rank, recv_device, group_name);
            let recv = receiver_worker.recv_tile(result.id, recv_device, placement, send_rank, send_device, group_name);
            futures::try_join!(send, recv)?;
        }
        Ok(result)
    }
}

// ── Prepared ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PreparedReshardingTask {
    ctx: TaskContext,
    tasks: CompiledTasks,
    send_ids: BTreeMap<WorkerId, TaskId>,
    recv_ids: BTreeMap<WorkerId, TaskId>,
    allgather_ids: BTreeMap<WorkerId, TaskId>,
    output_indices: Vec<Vec<IndexRange>>,
}

impl PreparedReshardingTask {
    /// Compile the task lists and register them on every worker.
    pub async fn new(ctx: TaskContext, ids: &TaskIdSource, eager_communicators: bool) -> Result<Self> {
        let tasks = compile(&ctx.spec, &ctx.group)?;
        let output_indices = VirtualDistributedArray::new(
            ctx.dst_mesh,
            ctx.spec.aval().clone(),
            ctx.spec.output_sharding_spec().clone(),
        )?
        .indices();

        let group = &ctx.group;
        let group_name = group.name();
        let mut send_ids = BTreeMap::new();
        let mut recv_ids = BTreeMap::new();
        let mut registrations = Vec::new();
        for (worker, list) in &tasks.send_tasks {
            let id = ids.next();
            send_ids.insert(*worker, id);
            registrations.push(group.worker(*worker)?.put_resharding_send_task(id, list.clone(), group_name));
        }
        for (worker, list) in &tasks.recv_tasks {
            let id = ids.next();
            recv_ids.insert(*worker, id);
            registrations.push(group.worker(*worker)?.put_resharding_recv_task(id, list.clone(), group_name));
        }
        try_join_all(registrations).await?;

        let mut allgather_ids = BTreeMap::new();
        let mut registrations = Vec::new();
        for (worker, list) in &tasks.allgather_tasks {
            let id = ids.next();
            allgather_ids.insert(*worker, id);
            registrations.push(group.worker(*worker)?.put_resharding_allgather_task(id, list.clone()));
        }
        try_join_all(registrations).await?;

        debug!(
            task = %ctx.spec,
            sends = tasks.num_sends(),
            recvs = tasks.num_recvs(),
            allgather_groups = tasks.num_allgather_groups(),
            "resharding task registered"
        );

        let task = Self { ctx, tasks, send_ids, recv_ids, allgather_ids, output_indices };
        if eager_communicators {
            task.create_communicators().await?;
        }
        Ok(task)
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn compiled(&self) -> &CompiledTasks {
        &self.tasks
    }

    pub fn send_task_ids(&self) -> &BTreeMap<WorkerId, TaskId> {
        &self.send_ids
    }

    pub fn recv_task_ids(&self) -> &BTreeMap<WorkerId, TaskId> {
        &self.recv_ids
    }

    pub fn allgather_task_ids(&self) -> &BTreeMap<WorkerId, TaskId> {
        &self.allgather_ids
    }

    /// Set up one communicator per exchanging device pair ahead of replay.
    pub async fn create_communicators(&self) -> Result<()> {
        let group = &self.ctx.group;
        let group_name = group.name();
        let pairs = self.tasks.p2p_pairs(group)?;
        for (src_rank, src_device, dst_rank, dst_device) in &pairs {
            let src_worker = group.worker_at_rank(*src_rank)?;
            let dst_worker = group.worker_at_rank(*dst_rank)?;
            let uid = src_worker.generate_nccl_uid(group_name).await?;
            futures::try_join!(
                src_worker.init_p2p_communicator(group_name, *src_rank, *src_device, *dst_rank, *dst_device, uid),
                dst_worker.init_p2p_communicator(group_name, *dst_rank, *dst_device, *src_rank, *src_device, uid),
            )?;
        }
        debug!(group = %group_name, communicators = pairs.len(), "p2p communicators created");
        Ok(())
    }

    /// Fresh destination buffers and the source buffer ids each send entry reads.
    fn buffer_plan(
        &self,
        src_array: &DistributedArray,
    ) -> Result<(BTreeMap<WorkerId, Vec<BufferId>>, BTreeMap<WorkerId, Vec<BufferId>>, HashMap<DeviceId, BufferRef>)> {
        let dtype = self.ctx.spec.aval().dtype;
        let mut results = HashMap::new();
        let mut recv_buffers = BTreeMap::new();
        for (worker, receivers) in &self.tasks.receiver_plan {
            let ids: Vec<BufferId> = receivers
                .iter()
                .map(|device| {
                    let buffer = BufferRef::new(*device, dtype);
                    results.insert(*device, buffer);
                    buffer.id
                })
                .collect();
            recv_buffers.insert(*worker, ids);
        }

        let mut send_buffers = BTreeMap::new();
        for (worker, senders) in &self.tasks.sender_plan {
            let ids = senders
                .iter()
                .map(|device| self.ctx.source_buffer(src_array, *device).map(|b| b.id))
                .collect::<Result<Vec<_>>>()?;
            send_buffers.insert(*worker, ids);
        }
        Ok((send_buffers, recv_buffers, results))
    }

    /// Replay the registered lists and return the array in its output sharding.
    pub async fn do_prepared(&self, src_array: &DistributedArray) -> Result<DistributedArray> {
        self.ctx.check_source(src_array)?;
        let group = &self.ctx.group;
        let (mut send_buffers, mut recv_buffers, results) = self.buffer_plan(src_array)?;

        let mut runs = Vec::new();
        for (worker, id) in &self.send_ids {
            let buffers = send_buffers.remove(worker).unwrap_or_default();
            runs.push(group.worker(*worker)?.run_resharding_send_task(*id, buffers));
        }
        for (worker, id) in &self.recv_ids {
            let buffers = recv_buffers.remove(worker).unwrap_or_default();
            runs.push(group.worker(*worker)?.run_resharding_recv_task(*id, buffers));
        }
        debug!(task = %self.ctx.spec, workers = runs.len(), "precompiled tasks launched");
        try_join_all(runs).await?;

        if !self.allgather_ids.is_empty() {
            let mut gathers = Vec::new();
            for (worker, id) in &self.allgather_ids {
                let buffers = (0..self.ctx.dst_mesh.num_devices_per_host)
                    .map(|d| {
                        let device = DeviceId::new(worker.mesh_id, worker.host, d);
                        results
                            .get(&device)
                            .map(|b| b.id)
                            .ok_or_else(|| ReshardError::Planning(format!("no buffer received on {device}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                gathers.push(group.worker(*worker)?.run_resharding_allgather_task(*id, buffers));
            }
            try_join_all(gathers).await?;
        }

        self.ctx.assemble(
            results,
            self.ctx.spec.output_sharding_spec().clone(),
            self.output_indices.clone(),
        )
    }

    /// Replay send and receive lists with timing; no array is assembled.
    pub async fn do_prepared_profiled(&self, src_array: &DistributedArray) -> Result<Vec<TaskProfile>> {
        self.ctx.check_source(src_array)?;
        let group = &self.ctx.group;
        let (mut send_buffers, mut recv_buffers, _) = self.buffer_plan(src_array)?;

        let mut runs = Vec::new();
        for (worker, id) in &self.send_ids {
            let buffers = send_buffers.remove(worker).unwrap_or_default();
            runs.push(group.worker(*worker)?.profile_resharding_send_task(*id, buffers));
        }
        for (worker, id) in &self.recv_ids {
            let buffers = recv_buffers.remove(worker).unwrap_or_default();
            runs.push(group.worker(*worker)?.profile_resharding_recv_task(*id, buffers));
        }
        try_join_all(runs).await
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ReshardingTask {
    Immediate(ImmediateReshardingTask),
    Prepared(PreparedReshardingTask),
}

impl ReshardingTask {
    pub fn context(&self) -> &TaskContext {
        match self {
            Self::Immediate(task) => task.context(),
            Self::Prepared(task) => task.context(),
        }
    }

    pub fn spec(&self) -> &ReshardingTaskSpec {
        &self.context().spec
    }

    pub fn group(&self) -> &Arc<CollectiveGroup> {
        &self.context().group
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self, Self::Prepared(_))
    }

    pub async fn execute(&self, src_array: &DistributedArray) -> Result<DistributedArray> {
        let out = match self {
            Self::Immediate(task) => task.do_immediate(src_array).await?,
            Self::Prepared(task) => task.do_prepared(src_array).await?,
        };
        info!(
            src_mesh = self.context().src_mesh.mesh_id,
            dst_mesh = self.context().dst_mesh.mesh_id,
            shape = ?self.spec().aval().shape,
            "resharding task executed"
        );
        Ok(out)
    }
}

impl fmt::Display for ReshardingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spec = self.spec();
        write!(
            f,
            "ReshardingTask(shape: {:?}, {} -> {})",
            spec.aval().shape,
            spec.src_sharding_spec(),
            spec.dst_sharding_spec()
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
