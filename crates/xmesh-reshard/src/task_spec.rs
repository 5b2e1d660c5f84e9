//! Resharding task specs: which source bytes rebuild every destination tile.
//!
//! For each destination tile the mapping lists the source [`TileSlice`]s that
//! intersect it and, for every slice, the box it occupies inside the
//! destination tile. The boxes of one destination tile never overlap and
//! cover it completely.
//!
//! Construction is two-phase: build the spec, then call
//! [`ReshardingTaskSpec::compute_mapping`]. Reads never compute anything.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use xmesh_types::sharding::unflatten_index;
use xmesh_types::{Aval, DeviceId, IndexRange, ShardingSpec};

use crate::error::{ReshardError, Result};
use crate::tile::{Tile, TileSlice, VirtualDistributedArray};

// ── Mapping ───────────────────────────────────────────────────────────────────

/// Source contributions to one destination tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileMapping {
    pub dst_tile: Tile,
    pub src_slices: Vec<TileSlice>,
    /// `indices_in_dst[i]` is where `src_slices[i]` lands, relative to the
    /// destination tile's origin.
    pub indices_in_dst: Vec<Vec<IndexRange>>,
}

/// Decompose every destination tile into source tile-slices.
pub fn compute_mapping(
    src: &VirtualDistributedArray,
    dst: &VirtualDistributedArray,
) -> Result<Vec<TileMapping>> {
    if src.tensor_shape() != dst.tensor_shape() {
        return Err(ReshardError::Planning(format!(
            "source shape {:?} differs from destination shape {:?}",
            src.tensor_shape(),
            dst.tensor_shape()
        )));
    }
    dst.tiles()
        .iter()
        .map(|tile| look_up_dst_tile_from_src(src, tile))
        .collect()
}

fn look_up_dst_tile_from_src(src: &VirtualDistributedArray, tile: &Tile) -> Result<TileMapping> {
    let rank = src.tensor_rank();
    let element_bytes = src.aval().dtype.element_bytes();

    // Per axis: source tiles [start, end) touching this tile, the offset into
    // the first one and the extent used of the last one.
    let mut tile_start_end = Vec::with_capacity(rank);
    let mut tile_offsets = Vec::with_capacity(rank);
    for axis in 0..rank {
        // Non-zero and exact: `VirtualDistributedArray::new` rejects anything else.
        let tile_length = src.tensor_shape()[axis] / src.grid_shape()[axis];
        let range = tile.indices[axis];

        let start_tile = range.start / tile_length;
        let start_offset = range.start % tile_length;
        let mut end_tile = range.end / tile_length;
        let mut end_offset = range.end % tile_length;
        if end_offset != 0 {
            end_tile += 1;
        } else {
            end_offset = tile_length;
        }
        tile_start_end.push((start_tile, end_tile));
        tile_offsets.push((start_offset, end_offset));
    }

    let counts: Vec<usize> = tile_start_end.iter().map(|(s, e)| e - s).collect();
    let num_slices: usize = counts.iter().product();
    let dst_shape = tile.tile_shape();

    let mut src_slices = Vec::with_capacity(num_slices);
    let mut indices_in_dst = Vec::with_capacity(num_slices);
    for slice_index in 0..num_slices {
        let relative = unflatten_index(slice_index, &counts);
        let absolute: Vec<usize> = relative
            .iter()
            .zip(&tile_start_end)
            .map(|(r, (start, _))| start + r)
            .collect();
        let src_tile = src.tile(&absolute);
        let src_shape = src_tile.tile_shape();

        let mut offset = Vec::with_capacity(rank);
        let mut placement = Vec::with_capacity(rank);
        for axis in 0..rank {
            let (start, end) = tile_start_end[axis];
            let (start_offset, end_offset) = tile_offsets[axis];
            let r = absolute[axis];
            let src_len = src_shape[axis];
            let dst_len = dst_shape[axis];

            if r == start && r == end - 1 {
                // The destination tile sits inside this source tile.
                offset.push(IndexRange { start: start_offset, end: end_offset });
                placement.push(IndexRange { start: 0, end: dst_len });
            } else if r == start {
                offset.push(IndexRange { start: start_offset, end: src_len });
                placement.push(IndexRange { start: 0, end: src_len - start_offset });
            } else if r == end - 1 {
                offset.push(IndexRange { start: 0, end: end_offset });
                placement.push(IndexRange { start: dst_len - end_offset, end: dst_len });
            } else {
                let left = src_len - start_offset + (relative[axis] - 1) * src_len;
                offset.push(IndexRange { start: 0, end: src_len });
                placement.push(IndexRange { start: left, end: left + src_len });
            }
        }

        src_slices.push(TileSlice::new(src_tile.clone(), offset, element_bytes));
        indices_in_dst.push(placement);
    }

    Ok(TileMapping { dst_tile: tile.clone(), src_slices, indices_in_dst })
}

// ── Allgather slice ───────────────────────────────────────────────────────────

/// Extra split applied to a destination sharding, undone by a local
/// allgather after the point-to-point step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllGatherSlice {
    pub tensor_axis: usize,
    pub mesh_axis: usize,
    pub extra_sharding: usize,
}

// ── Strategy ──────────────────────────────────────────────────────────────────

/// Chosen sender for every (destination tile, replica, source slice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshardingStrategy {
    /// `per_tile_plans[t][replica][slice]`.
    pub per_tile_plans: Vec<Vec<Vec<DeviceId>>>,
    pub is_local_allgather: bool,
}

impl ReshardingStrategy {
    pub fn tile_plan(&self, tile: usize) -> &[Vec<DeviceId>] {
        &self.per_tile_plans[tile]
    }

    pub fn sender(&self, tile: usize, replica: usize, slice: usize) -> DeviceId {
        self.per_tile_plans[tile][replica][slice]
    }
}

// ── Task spec ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReshardingTaskSpec {
    src: VirtualDistributedArray,
    dst: VirtualDistributedArray,
    allgather_slice: Option<AllGatherSlice>,
    output_sharding_spec: ShardingSpec,
    mapping: Option<Vec<TileMapping>>,
    strategy: Option<ReshardingStrategy>,
}

impl ReshardingTaskSpec {
    pub fn new(
        src: VirtualDistributedArray,
        dst: VirtualDistributedArray,
        allgather_slice: Option<AllGatherSlice>,
    ) -> Self {
        let output_sharding_spec = dst.sharding_spec().clone();
        Self { src, dst, allgather_slice, output_sharding_spec, mapping: None, strategy: None }
    }

    /// Sharding the destination holds once the allgather step has run.
    pub fn with_output_sharding(mut self, spec: ShardingSpec) -> Self {
        self.output_sharding_spec = spec;
        self
    }

    pub fn src(&self) -> &VirtualDistributedArray {
        &self.src
    }

    pub fn dst(&self) -> &VirtualDistributedArray {
        &self.dst
    }

    pub fn aval(&self) -> &Aval {
        self.src.aval()
    }

    pub fn src_sharding_spec(&self) -> &ShardingSpec {
        self.src.sharding_spec()
    }

    pub fn dst_sharding_spec(&self) -> &ShardingSpec {
        self.dst.sharding_spec()
    }

    pub fn output_sharding_spec(&self) -> &ShardingSpec {
        &self.output_sharding_spec
    }

    pub fn allgather_slice(&self) -> Option<AllGatherSlice> {
        self.allgather_slice
    }

    pub fn src_indices(&self) -> Vec<Vec<IndexRange>> {
        self.src.indices()
    }

    pub fn dst_indices(&self) -> Vec<Vec<IndexRange>> {
        self.dst.indices()
    }

    /// Populate the tile mapping. Later calls return the stored result.
    pub fn compute_mapping(&mut self) -> Result<&[TileMapping]> {
        if self.mapping.is_none() {
            self.mapping = Some(compute_mapping(&self.src, &self.dst)?);
        }
        self.dst_tile_to_src_tiles_map()
    }

    pub fn dst_tile_to_src_tiles_map(&self) -> Result<&[TileMapping]> {
        self.mapping.as_deref().ok_or(ReshardError::MappingNotComputed)
    }

    pub fn set_strategy(&mut self, strategy: ReshardingStrategy) -> Result<()> {
        if self.strategy.is_some() {
            return Err(ReshardError::StrategyAlreadySet);
        }
        self.strategy = Some(strategy);
        Ok(())
    }

    pub fn strategy(&self) -> Result<&ReshardingStrategy> {
        self.strategy.as_ref().ok_or(ReshardError::StrategyNotSet)
    }

    /// Buffer shape a receiver allocates for `dst_tile`: the tile itself, or
    /// the gathered tile when an allgather step follows.
    pub fn recv_buffer_shape(&self, dst_tile: &Tile) -> Vec<usize> {
        let mut shape = dst_tile.tile_shape();
        if let Some(slice) = self.allgather_slice {
            shape[slice.tensor_axis] *= slice.extra_sharding;
        }
        shape
    }

    /// Every device taking part: chosen senders first, then receivers, each
    /// once in first-seen order.
    pub fn participant_devices(&self) -> Result<Vec<DeviceId>> {
        let strategy = self.strategy()?;
        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        let senders = strategy.per_tile_plans.iter().flatten().flatten();
        let receivers = self.dst.tiles().iter().flat_map(|t| t.replica_devices.iter());
        for device in senders.chain(receivers) {
            if seen.insert(*device) {
                devices.push(*device);
            }
        }
        Ok(devices)
    }

    /// Total bytes crossing the mesh boundary under the current strategy.
    pub fn transfer_bytes(&self) -> Result<u64> {
        let mapping = self.dst_tile_to_src_tiles_map()?;
        Ok(mapping
            .iter()
            .map(|m| {
                let per_replica: u64 = m.src_slices.iter().map(TileSlice::slice_bytes).sum();
                per_replica * m.dst_tile.replica_devices.len() as u64
            })
            .sum())
    }
}

impl fmt::Display for ReshardingTaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {};", self.src_sharding_spec(), self.dst_sharding_spec())?;
        if let Some(slice) = self.allgather_slice {
            write!(
                f,
                " allgather: shard at tensor dim {}, shard at mesh axis {}, chunked value {}",
                slice.tensor_axis, slice.mesh_axis, slice.extra_sharding
            )?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
