//! Tile geometry of a sharded array.
//!
//! A [`VirtualDistributedArray`] lays a logical array over a mesh according
//! to a sharding spec without owning any buffers. Its tiles form a dense
//! row-major grid that partitions the array's index space exactly; every
//! tile lists the devices holding a replica of it.

use xmesh_types::sharding::unflatten_index;
use xmesh_types::{Aval, DeviceId, IndexRange, Mesh, ShardingSpec};

use crate::error::{ReshardError, Result};

// ── Tile ──────────────────────────────────────────────────────────────────────

/// One partition cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    /// Coordinate in the tile grid.
    pub index: Vec<usize>,
    /// Absolute index ranges covered by this tile.
    pub indices: Vec<IndexRange>,
    /// Devices holding a copy, in mesh order.
    pub replica_devices: Vec<DeviceId>,
}

impl Tile {
    pub fn tile_shape(&self) -> Vec<usize> {
        self.indices.iter().map(IndexRange::len).collect()
    }

    pub fn tile_elements(&self) -> usize {
        self.indices.iter().map(IndexRange::len).product()
    }
}

// ── TileSlice ─────────────────────────────────────────────────────────────────

/// A sub-box of one source tile: the unit moved by one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSlice {
    pub tile: Tile,
    /// Ranges within `tile`, relative to its origin.
    pub offset: Vec<IndexRange>,
    element_bytes: usize,
}

impl TileSlice {
    pub fn new(tile: Tile, offset: Vec<IndexRange>, element_bytes: usize) -> Self {
        Self { tile, offset, element_bytes }
    }

    pub fn replica_devices(&self) -> &[DeviceId] {
        &self.tile.replica_devices
    }

    pub fn slice_shape(&self) -> Vec<usize> {
        self.offset.iter().map(IndexRange::len).collect()
    }

    pub fn slice_elements(&self) -> usize {
        self.offset.iter().map(IndexRange::len).product()
    }

    /// Bytes carried over the wire for this slice.
    pub fn slice_bytes(&self) -> u64 {
        (self.slice_elements() * self.element_bytes) as u64
    }
}

// ── VirtualDistributedArray ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VirtualDistributedArray {
    mesh: Mesh,
    aval: Aval,
    sharding_spec: ShardingSpec,
    grid_shape: Vec<usize>,
    tiles: Vec<Tile>,
    /// Per device (mesh order): flat tile index it holds.
    device_tiles: Vec<usize>,
}

impl VirtualDistributedArray {
    pub fn new(mesh: Mesh, aval: Aval, sharding_spec: ShardingSpec) -> Result<Self> {
        sharding_spec.validate(aval.rank(), mesh.num_devices())?;

        let grid_shape = sharding_spec.tile_grid_shape();
        let mut tile_lengths = Vec::with_capacity(aval.rank());
        for (axis, (len, num_tiles)) in aval.shape.iter().zip(&grid_shape).enumerate() {
            if *len == 0 {
                return Err(ReshardError::EmptyAxis { axis });
            }
            if len % num_tiles != 0 {
                return Err(ReshardError::IncompatibleSharding {
                    axis,
                    axis_len: *len,
                    num_tiles: *num_tiles,
                });
            }
            tile_lengths.push(len / num_tiles);
        }

        let num_tiles: usize = grid_shape.iter().product();
        let mut tiles: Vec<Tile> = (0..num_tiles)
            .map(|flat| {
                let index = unflatten_index(flat, &grid_shape);
                let indices = index
                    .iter()
                    .zip(&tile_lengths)
                    .map(|(i, len)| IndexRange { start: i * len, end: (i + 1) * len })
                    .collect();
                Tile { index, indices, replica_devices: Vec::new() }
            })
            .collect();

        let mut device_tiles = Vec::with_capacity(mesh.num_devices());
        for (flat_device, device) in mesh.device_ids().into_iter().enumerate() {
            let tile_index = sharding_spec.tile_index_for_device(flat_device)?;
            let flat_tile = flatten_index(&tile_index, &grid_shape);
            tiles[flat_tile].replica_devices.push(device);
            device_tiles.push(flat_tile);
        }

        Ok(Self { mesh, aval, sharding_spec, grid_shape, tiles, device_tiles })
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn aval(&self) -> &Aval {
        &self.aval
    }

    pub fn sharding_spec(&self) -> &ShardingSpec {
        &self.sharding_spec
    }

    pub fn tensor_shape(&self) -> &[usize] {
        &self.aval.shape
    }

    pub fn tensor_rank(&self) -> usize {
        self.aval.rank()
    }

    /// Number of tiles along every axis.
    pub fn grid_shape(&self) -> &[usize] {
        &self.grid_shape
    }

    /// All tiles, row-major over the grid.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self, grid_index: &[usize]) -> &Tile {
        &self.tiles[flatten_index(grid_index, &self.grid_shape)]
    }

    /// Tile held by the device at `flat_device` (mesh order).
    pub fn tile_for_device(&self, flat_device: usize) -> Option<&Tile> {
        self.device_tiles.get(flat_device).map(|t| &self.tiles[*t])
    }

    /// Absolute index ranges per device, in mesh order.
    pub fn indices(&self) -> Vec<Vec<IndexRange>> {
        self.device_tiles
            .iter()
            .map(|t| self.tiles[*t].indices.clone())
            .collect()
    }

    pub fn device_flat_index(&self, device: DeviceId) -> Result<usize> {
        Ok(self.mesh.flat_index(device)?)
    }
}

/// Row-major flattening of `coords` within `shape`.
pub fn flatten_index(coords: &[usize], shape: &[usize]) -> usize {
    coords
        .iter()
        .zip(shape)
        .fold(0, |acc, (c, size)| acc * size + c)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use xmesh_types::{DimSharding::*, Dtype, MeshMapping::*};

    #[test]
    fn two_by_two_grid() {
        let mesh = Mesh::new(1, 1, 4).unwrap();
        let spec = ShardingSpec::new(vec![Chunked(2), Chunked(2)], vec![ShardedAxis(0), ShardedAxis(1)]);
        let arr = VirtualDistributedArray::new(mesh, Aval::new(vec![4, 6], Dtype::F32), spec).unwrap();

        assert_eq!(arr.grid_shape(), &[2, 2]);
        assert_eq!(arr.tiles().len(), 4);
        let t = arr.tile(&[1, 0]);
        assert_eq!(t.indices, vec![IndexRange { start: 2, end: 4 }, IndexRange { start: 0, end: 3 }]);
        assert_eq!(t.tile_shape(), vec![2, 3]);
        assert_eq!(t.replica_devices, vec![DeviceId::new(1, 0, 2)]);
    }

    #[test]
    fn replicas_collected_in_mesh_order() {
        let mesh = Mesh::new(0, 2, 2).unwrap();
        let spec = ShardingSpec::new(vec![Chunked(2), Unsharded], vec![Replicated(2), ShardedAxis(0)]);
        let arr = VirtualDistributedArray::new(mesh, Aval::new(vec![8, 2], Dtype::F16), spec).unwrap();

        let t0 = arr.tile(&[0, 0]);
        assert_eq!(t0.replica_devices, vec![DeviceId::new(0, 0, 0), DeviceId::new(0, 1, 0)]);
        let t1 = arr.tile(&[1, 0]);
        assert_eq!(t1.replica_devices, vec![DeviceId::new(0, 0, 1), DeviceId::new(0, 1, 1)]);

        let indices = arr.indices();
        assert_eq!(indices.len(), 4);
        assert_eq!(indices[0], indices[2]);
        assert_eq!(indices[3][0], IndexRange { start: 4, end: 8 });
    }

    #[test]
    fn tiles_partition_index_space() {
        let mesh = Mesh::new(0, 1, 6).unwrap();
        let spec = ShardingSpec::new(vec![Chunked(3), Chunked(2)], vec![ShardedAxis(0), ShardedAxis(1)]);
        let arr = VirtualDistributedArray::new(mesh, Aval::new(vec![6, 4], Dtype::U8), spec).unwrap();

        let mut covered = vec![0u32; 24];
        for tile in arr.tiles() {
            for r in tile.indices[0].start..tile.indices[0].end {
                for c in tile.indices[1].start..tile.indices[1].end {
                    covered[r * 4 + c] += 1;
                }
            }
        }
        assert!(covered.iter().all(|n| *n == 1));
    }

    #[test]
    fn uneven_split_rejected() {
        let mesh = Mesh::new(0, 1, 4).unwrap();
        let spec = ShardingSpec::new(vec![Chunked(4)], vec![ShardedAxis(0)]);
        let err = VirtualDistributedArray::new(mesh, Aval::new(vec![6], Dtype::F32), spec).unwrap_err();
        assert!(matches!(err, ReshardError::IncompatibleSharding { axis: 0, axis_len: 6, num_tiles: 4 }));
    }

    #[test]
    fn slice_sizes() {
        let tile = Tile {
            index: vec![0, 0],
            indices: vec![IndexRange::full(4), IndexRange::full(4)],
            replica_devices: vec![DeviceId::new(0, 0, 0)],
        };
        let slice = TileSlice::new(tile, vec![IndexRange { start: 1, end: 3 }, IndexRange::full(4)], 4);
        assert_eq!(slice.slice_shape(), vec![2, 4]);
        assert_eq!(slice.slice_elements(), 8);
        assert_eq!(slice.slice_bytes(), 32);
    }

    #[test]
    fn flatten_matches_unflatten() {
        let shape = [3, 2, 4];
        for flat in 0..24 {
            assert_eq!(flatten_index(&unflatten_index(flat, &shape), &shape), flat);
        }
    }
}
