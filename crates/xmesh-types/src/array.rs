// Abstract values, pipeline variables and the distributed-array handle
// exchanged between the resharding core and the runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mesh::DeviceId;
use crate::sharding::{IndexRange, ShardingSpec};

// ── Dtype ─────────────────────────────────────────────────────────────────────

/// Element type of a logical array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Dtype {
    F16  = 0,
    BF16 = 1,
    F32  = 2,
    F64  = 3,
    I8   = 4,
    I32  = 5,
    I64  = 6,
    U8   = 7,
    Bool = 8,
}

impl Dtype {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::F16),
            1 => Some(Self::BF16),
            2 => Some(Self::F32),
            3 => Some(Self::F64),
            4 => Some(Self::I8),
            5 => Some(Self::I32),
            6 => Some(Self::I64),
            7 => Some(Self::U8),
            8 => Some(Self::Bool),
            _ => None,
        }
    }

    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }
}

// ── Aval ──────────────────────────────────────────────────────────────────────

/// Abstract value: shape and element type, never materialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aval {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl Aval {
    pub fn new(shape: Vec<usize>, dtype: Dtype) -> Self {
        Self { shape, dtype }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn num_bytes(&self) -> usize {
        self.num_elements() * self.dtype.element_bytes()
    }
}

// ── Var ───────────────────────────────────────────────────────────────────────

/// A logical array flowing between pipeline stages, identified by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub aval: Aval,
}

impl Var {
    pub fn new(name: impl Into<String>, aval: Aval) -> Self {
        Self { name: name.into(), aval }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}{:?}", self.name, self.aval.dtype, self.aval.shape)
    }
}

// ── Buffers ───────────────────────────────────────────────────────────────────

/// Globally unique identifier of a physical on-device buffer.
pub type BufferId = Uuid;

/// Handle to a buffer living on one device of one mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferRef {
    pub id: BufferId,
    pub device: DeviceId,
    pub dtype: Dtype,
}

impl BufferRef {
    /// Reference a fresh buffer on `device`. Allocation is the worker's job.
    pub fn new(device: DeviceId, dtype: Dtype) -> Self {
        Self { id: Uuid::new_v4(), device, dtype }
    }

    pub fn mesh_id(&self) -> usize {
        self.device.mesh_id
    }

    pub fn host(&self) -> usize {
        self.device.host
    }

    pub fn local_device(&self) -> usize {
        self.device.device
    }
}

// ── Distributed array ─────────────────────────────────────────────────────────

/// A logical array materialized as one buffer per device of a mesh.
///
/// `buffers[i]` and `indices[i]` describe the i-th device in mesh order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedArray {
    pub mesh_id: usize,
    pub aval: Aval,
    pub sharding_spec: ShardingSpec,
    pub buffers: Vec<BufferRef>,
    pub indices: Vec<Vec<IndexRange>>,
}

impl DistributedArray {
    pub fn new(
        mesh_id: usize,
        aval: Aval,
        sharding_spec: ShardingSpec,
        buffers: Vec<BufferRef>,
        indices: Vec<Vec<IndexRange>>,
    ) -> Self {
        Self { mesh_id, aval, sharding_spec, buffers, indices }
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_round_trip() {
        for v in 0..=8u8 {
            let dt = Dtype::from_u8(v).unwrap();
            assert_eq!(dt as u8, v);
        }
        assert!(Dtype::from_u8(9).is_none());
    }

    #[test]
    fn dtype_element_bytes() {
        assert_eq!(Dtype::Bool.element_bytes(), 1);
        assert_eq!(Dtype::BF16.element_bytes(), 2);
        assert_eq!(Dtype::F32.element_bytes(), 4);
        assert_eq!(Dtype::I64.element_bytes(), 8);
    }

    #[test]
    fn aval_sizes() {
        let aval = Aval::new(vec![4, 8, 2], Dtype::F16);
        assert_eq!(aval.rank(), 3);
        assert_eq!(aval.num_elements(), 64);
        assert_eq!(aval.num_bytes(), 128);
    }

    #[test]
    fn buffer_refs_are_unique() {
        let dev = DeviceId::new(1, 0, 3);
        let a = BufferRef::new(dev, Dtype::F32);
        let b = BufferRef::new(dev, Dtype::F32);
        assert_ne!(a.id, b.id);
        assert_eq!(a.mesh_id(), 1);
        assert_eq!(a.local_device(), 3);
    }

    #[test]
    fn var_serde() {
        let var = Var::new("hidden", Aval::new(vec![16, 32], Dtype::BF16));
        let json = serde_json::to_string(&var).unwrap();
        let round: Var = serde_json::from_str(&json).unwrap();
        assert_eq!(round, var);
    }
}
