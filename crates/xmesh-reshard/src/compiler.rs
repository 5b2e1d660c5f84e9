//! Expands a resharding strategy into per-worker task lists.
//!
//! Send and receive entries are emitted in lockstep: for every destination
//! tile, every replica of it and every source slice, one `SendTileSpec` lands
//! on the chosen sender's worker and one `RecvTileSpec` on the receiver's.
//! Replaying both lists in order therefore pairs every send with its receive.

use std::collections::{BTreeMap, HashSet};

use xmesh_types::{DeviceId, IndexRange, Mesh, WorkerId};

use crate::collective::CollectiveGroup;
use crate::error::{ReshardError, Result};
use crate::task_spec::{AllGatherSlice, ReshardingTaskSpec};
use crate::worker::{AllGatherSpec, RecvSpec, RecvTileSpec, SendTileSpec};

/// Output of [`compile`]. Every source worker has a send list and every
/// destination worker a receive list, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledTasks {
    pub send_tasks: BTreeMap<WorkerId, Vec<SendTileSpec>>,
    pub recv_tasks: BTreeMap<WorkerId, Vec<RecvSpec>>,
    /// Empty unless the spec carries an allgather step.
    pub allgather_tasks: BTreeMap<WorkerId, Vec<AllGatherSpec>>,
    /// Per source worker, the device whose buffer feeds each send entry.
    pub sender_plan: BTreeMap<WorkerId, Vec<DeviceId>>,
    /// Per destination worker, the device receiving each `RecvSpec`.
    pub receiver_plan: BTreeMap<WorkerId, Vec<DeviceId>>,
}

impl CompiledTasks {
    pub fn num_sends(&self) -> usize {
        self.send_tasks.values().map(Vec::len).sum()
    }

    pub fn num_recvs(&self) -> usize {
        self.recv_tasks.values().map(Vec::len).sum()
    }

    pub fn num_allgather_groups(&self) -> usize {
        self.allgather_tasks.values().map(Vec::len).sum()
    }

    /// Distinct `(src_rank, src_device, dst_rank, dst_device)` pairs that
    /// exchange data, in first-use order.
    pub fn p2p_pairs(&self, group: &CollectiveGroup) -> Result<Vec<(usize, usize, usize, usize)>> {
        let mut seen = HashSet::new();
        let mut pairs = Vec::new();
        for (worker, recvs) in &self.recv_tasks {
            let dst_rank = group.worker_rank(*worker)?;
            for recv in recvs {
                for tile in &recv.tiles {
                    let pair = (tile.src_rank, tile.src_device, dst_rank, recv.device);
                    if seen.insert(pair) {
                        pairs.push(pair);
                    }
                }
            }
        }
        Ok(pairs)
    }
}

pub fn compile(spec: &ReshardingTaskSpec, group: &CollectiveGroup) -> Result<CompiledTasks> {
    let mapping = spec.dst_tile_to_src_tiles_map()?;
    let strategy = spec.strategy()?;
    let layout = spec
        .allgather_slice()
        .map(|slice| AllGatherLayout::new(spec, slice))
        .transpose()?;
    let dtype = spec.aval().dtype;

    let mut tasks = CompiledTasks::default();
    for worker in spec.src().mesh().worker_ids() {
        tasks.send_tasks.insert(worker, Vec::new());
        tasks.sender_plan.insert(worker, Vec::new());
    }
    for worker in spec.dst().mesh().worker_ids() {
        tasks.recv_tasks.insert(worker, Vec::new());
        tasks.receiver_plan.insert(worker, Vec::new());
    }

    for (tile_index, tile_mapping) in mapping.iter().enumerate() {
        let tile_plan = strategy.per_tile_plans.get(tile_index).ok_or_else(|| {
            ReshardError::Planning(format!("strategy has no plan for destination tile {tile_index}"))
        })?;
        let buffer_shape = spec.recv_buffer_shape(&tile_mapping.dst_tile);

        for (replica, receiver) in tile_mapping.dst_tile.replica_devices.iter().enumerate() {
            let (recv_rank, recv_device) = group.device_rank(*receiver)?;
            push(&mut tasks.receiver_plan, receiver.worker(), *receiver);

            let mut tiles = Vec::with_capacity(tile_mapping.src_slices.len());
            for (i, slice) in tile_mapping.src_slices.iter().enumerate() {
                let sender = tile_plan
                    .get(replica)
                    .and_then(|senders| senders.get(i))
                    .copied()
                    .ok_or_else(|| {
                        ReshardError::Planning(format!(
                            "no sender for tile {tile_index}, replica {replica}, slice {i}"
                        ))
                    })?;
                let (send_rank, send_device) = group.device_rank(sender)?;

                push(
                    &mut tasks.send_tasks,
                    sender.worker(),
                    SendTileSpec { offset: slice.offset.clone(), dst_rank: recv_rank, dst_device: recv_device },
                );
                push(&mut tasks.sender_plan, sender.worker(), sender);

                let placement = &tile_mapping.indices_in_dst[i];
                let indices = match &layout {
                    Some(layout) => layout.post_allgather_indices(placement, *receiver)?,
                    None => placement.clone(),
                };
                tiles.push(RecvTileSpec { indices, src_rank: send_rank, src_device: send_device });
            }

            push(
                &mut tasks.recv_tasks,
                receiver.worker(),
                RecvSpec { device: recv_device, tile_shape: buffer_shape.clone(), dtype, tiles },
            );
        }
    }

    if let Some(layout) = &layout {
        tasks.allgather_tasks = layout.allgather_tasks(spec)?;
    }
    Ok(tasks)
}

fn push<T>(map: &mut BTreeMap<WorkerId, Vec<T>>, worker: WorkerId, item: T) {
    map.entry(worker).or_default().push(item);
}

// ── Allgather layout ──────────────────────────────────────────────────────────

/// Where a destination device sits within its allgather group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllGatherPosition {
    /// Position of this device's piece inside the gathered tile.
    pub offset: usize,
    /// Devices with equal `group` gather together.
    pub group: usize,
    /// Flat-index distance between neighbours of one group.
    pub step: usize,
}

/// Logical destination mesh geometry needed to place allgather pieces.
#[derive(Debug, Clone)]
pub struct AllGatherLayout {
    slice: AllGatherSlice,
    dst_mesh: Mesh,
    mesh_shape: [usize; 2],
    /// Extent of one piece along `slice.tensor_axis`.
    piece_len: usize,
}

impl AllGatherLayout {
    pub fn new(spec: &ReshardingTaskSpec, slice: AllGatherSlice) -> Result<Self> {
        let shape = spec.dst_sharding_spec().logical_mesh_shape()?;
        let mesh_shape = match shape.as_slice() {
            [] => [1, 1],
            [a] => [*a, 1],
            [a, b] => [*a, *b],
            more => return Err(ReshardError::UnsupportedMeshDim(more.len())),
        };
        if slice.mesh_axis > 1 {
            return Err(ReshardError::UnsupportedMeshDim(slice.mesh_axis + 1));
        }
        if slice.extra_sharding == 0 {
            return Err(ReshardError::Planning("allgather with zero extra sharding".into()));
        }
        let piece_len = spec.aval().shape[slice.tensor_axis] / mesh_shape[slice.mesh_axis];
        Ok(Self { slice, dst_mesh: *spec.dst().mesh(), mesh_shape, piece_len })
    }

    pub fn position(&self, device: DeviceId) -> Result<AllGatherPosition> {
        let flat = self.dst_mesh.flat_index(device)?;
        let cols = self.mesh_shape[1];
        let extra = self.slice.extra_sharding;
        let position = if self.slice.mesh_axis == 0 {
            let row = flat / cols;
            AllGatherPosition { offset: row % extra, group: row / extra * cols + flat % cols, step: cols }
        } else {
            AllGatherPosition { offset: (flat % cols) % extra, group: flat / extra, step: 1 }
        };
        Ok(position)
    }

    /// Shift `indices` (relative to a destination tile) into the gathered
    /// tile `device` ends up holding.
    pub fn post_allgather_indices(&self, indices: &[IndexRange], device: DeviceId) -> Result<Vec<IndexRange>> {
        let position = self.position(device)?;
        let mut out = indices.to_vec();
        let axis = self.slice.tensor_axis;
        out[axis] = out[axis].shift(position.offset * self.piece_len);
        Ok(out)
    }

    /// One `AllGatherSpec` per (worker, group), groups in ascending order.
    pub fn allgather_tasks(
        &self,
        spec: &ReshardingTaskSpec,
    ) -> Result<BTreeMap<WorkerId, Vec<AllGatherSpec>>> {
        let piece: Vec<IndexRange> = spec
            .dst()
            .tiles()
            .first()
            .map(|t| t.tile_shape().into_iter().map(IndexRange::full).collect())
            .unwrap_or_default();

        let mut groups: BTreeMap<WorkerId, BTreeMap<usize, AllGatherSpec>> = self
            .dst_mesh
            .worker_ids()
            .into_iter()
            .map(|w| (w, BTreeMap::new()))
            .collect();
        for device in self.dst_mesh.device_ids() {
            let position = self.position(device)?;
            let slice = self.post_allgather_indices(&piece, device)?;
            let entry = groups.entry(device.worker()).or_default().entry(position.group).or_default();
            entry.device_ids.push(device.device);
            entry.tensor_slices.push(slice);
        }
        Ok(groups
            .into_iter()
            .map(|(worker, by_group)| (worker, by_group.into_values().collect()))
            .collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
