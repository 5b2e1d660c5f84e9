//! Sharding specifications.
//!
//! A [`ShardingSpec`] has two halves:
//!
//! - `sharding`: one [`DimSharding`] per tensor axis, either unsharded or
//!   chunked into `n` equal pieces.
//! - `mesh_mapping`: one [`MeshMapping`] per *logical* mesh axis. A
//!   `ShardedAxis(k)` mesh axis splits the k-th chunked tensor axis; a
//!   `Replicated(r)` mesh axis holds `r` identical copies.
//!
//! The logical mesh shape is read off the mapping and must cover every
//! device of the physical mesh. Devices map onto logical coordinates in
//! canonical (host-major) order, row-major.
//!
//! ```text
//! tensor [4, 4], sharding [C2, C2], mapping [S0, S1], 4 devices
//!
//!   d0 -> rows 0..2, cols 0..2     d1 -> rows 0..2, cols 2..4
//!   d2 -> rows 2..4, cols 0..2     d3 -> rows 2..4, cols 2..4
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

// ── Index ranges ──────────────────────────────────────────────────────────────

/// Half-open range `[start, end)` along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start > end {
            return Err(MeshError::InvalidIndexRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// `[0, len)`.
    pub fn full(len: usize) -> Self {
        Self { start: 0, end: len }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn shift(&self, by: usize) -> Self {
        Self { start: self.start + by, end: self.end + by }
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// Render a multi-axis box as `[0:2, 2:4]`.
pub fn format_ranges(ranges: &[IndexRange]) -> String {
    let parts: Vec<String> = ranges.iter().map(IndexRange::to_string).collect();
    format!("[{}]", parts.join(", "))
}

// ── Per-axis descriptors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimSharding {
    Unsharded,
    Chunked(usize),
}

impl DimSharding {
    /// Number of pieces along this axis (1 when unsharded).
    pub fn chunks(&self) -> usize {
        match self {
            Self::Unsharded => 1,
            Self::Chunked(n) => *n,
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, Self::Chunked(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshMapping {
    ShardedAxis(usize),
    Replicated(usize),
}

// ── ShardingSpec ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardingSpec {
    pub sharding: Vec<DimSharding>,
    pub mesh_mapping: Vec<MeshMapping>,
}

impl ShardingSpec {
    pub fn new(sharding: Vec<DimSharding>, mesh_mapping: Vec<MeshMapping>) -> Self {
        Self { sharding, mesh_mapping }
    }

    /// Every device holds the whole array.
    pub fn replicated(rank: usize, num_devices: usize) -> Self {
        Self {
            sharding: vec![DimSharding::Unsharded; rank],
            mesh_mapping: vec![MeshMapping::Replicated(num_devices)],
        }
    }

    pub fn rank(&self) -> usize {
        self.sharding.len()
    }

    /// Tensor axes that are chunked, in axis order. `ShardedAxis(k)` refers
    /// to the k-th entry of this list.
    pub fn chunked_axes(&self) -> Vec<usize> {
        self.sharding
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_chunked())
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of tiles along every tensor axis.
    pub fn tile_grid_shape(&self) -> Vec<usize> {
        self.sharding.iter().map(DimSharding::chunks).collect()
    }

    /// Product of chunk counts over all tensor axes.
    pub fn total_sharding(&self) -> usize {
        self.sharding.iter().map(DimSharding::chunks).product()
    }

    /// Size of every logical mesh axis.
    pub fn logical_mesh_shape(&self) -> Result<Vec<usize>> {
        let chunked = self.chunked_axes();
        self.mesh_mapping
            .iter()
            .map(|m| match m {
                MeshMapping::ShardedAxis(k) => chunked
                    .get(*k)
                    .map(|axis| self.sharding[*axis].chunks())
                    .ok_or_else(|| {
                        MeshError::InvalidSharding(format!(
                            "ShardedAxis({k}) but only {} chunked axes",
                            chunked.len()
                        ))
                    }),
                MeshMapping::Replicated(r) => Ok(*r),
            })
            .collect()
    }

    /// Check internal consistency against an array rank and a device count.
    pub fn validate(&self, array_rank: usize, num_devices: usize) -> Result<()> {
        if self.rank() != array_rank {
            return Err(MeshError::RankMismatch { spec_rank: self.rank(), array_rank });
        }
        if self.sharding.iter().any(|s| s.chunks() == 0) {
            return Err(MeshError::InvalidSharding("zero-sized chunking".into()));
        }
        if self.mesh_mapping.iter().any(|m| matches!(m, MeshMapping::Replicated(0))) {
            return Err(MeshError::InvalidSharding("zero-sized replication".into()));
        }

        let num_chunked = self.chunked_axes().len();
        let mut seen = vec![false; num_chunked];
        for m in &self.mesh_mapping {
            if let MeshMapping::ShardedAxis(k) = m {
                match seen.get_mut(*k) {
                    Some(slot) if !*slot => *slot = true,
                    Some(_) => {
                        return Err(MeshError::InvalidSharding(format!(
                            "chunked axis #{k} mapped more than once"
                        )))
                    }
                    None => {
                        return Err(MeshError::InvalidSharding(format!(
                            "ShardedAxis({k}) but only {num_chunked} chunked axes"
                        )))
                    }
                }
            }
        }
        if let Some(k) = seen.iter().position(|s| !s) {
            return Err(MeshError::InvalidSharding(format!(
                "chunked axis #{k} is not mapped onto any mesh axis"
            )));
        }

        let shape = self.logical_mesh_shape()?;
        let expected: usize = shape.iter().product();
        if expected != num_devices {
            return Err(MeshError::DeviceCountMismatch { shape, expected, actual: num_devices });
        }
        Ok(())
    }

    /// Tile-grid coordinate held by the device at `flat_index` (canonical order).
    pub fn tile_index_for_device(&self, flat_index: usize) -> Result<Vec<usize>> {
        let mesh_shape = self.logical_mesh_shape()?;
        let coords = unflatten_index(flat_index, &mesh_shape);
        let chunked = self.chunked_axes();

        let mut tile_index = vec![0; self.rank()];
        for (mesh_axis, mapping) in self.mesh_mapping.iter().enumerate() {
            if let MeshMapping::ShardedAxis(k) = mapping {
                tile_index[chunked[*k]] = coords[mesh_axis];
            }
        }
        Ok(tile_index)
    }
}

impl fmt::Display for ShardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .sharding
            .iter()
            .map(|s| match s {
                DimSharding::Unsharded => "-".to_string(),
                DimSharding::Chunked(n) => format!("C{n}"),
            })
            .collect();
        let mapping: Vec<String> = self
            .mesh_mapping
            .iter()
            .map(|m| match m {
                MeshMapping::ShardedAxis(k) => format!("S{k}"),
                MeshMapping::Replicated(r) => format!("R{r}"),
            })
            .collect();
        write!(f, "[{}] @ [{}]", dims.join(", "), mapping.join(", "))
    }
}

/// Row-major unflattening of `flat` into coordinates of `shape`.
pub fn unflatten_index(flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    let mut rest = flat;
    for (axis, size) in shape.iter().enumerate().rev() {
        coords[axis] = rest % size;
        rest /= size;
    }
    coords
}

// ── Tests ─────────────────────────────────────────────────────────────────────
