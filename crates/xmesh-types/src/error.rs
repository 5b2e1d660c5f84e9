// Shared error type for mesh, sharding and pipeline-description validation.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    // ── Meshes ────────────────────────────────────────────────────────────

    #[error("mesh {mesh_id} must have at least one host and one device per host")]
    EmptyMesh { mesh_id: usize },

    #[error("device {device} does not belong to mesh {mesh_id}")]
    UnknownDevice { mesh_id: usize, device: String },

    // ── Sharding ──────────────────────────────────────────────────────────

    #[error("sharding spec has rank {spec_rank}, but the array has rank {array_rank}")]
    RankMismatch { spec_rank: usize, array_rank: usize },

    #[error("logical mesh shape {shape:?} covers {expected} device(s), but the mesh has {actual}")]
    DeviceCountMismatch { shape: Vec<usize>, expected: usize, actual: usize },

    #[error("invalid sharding spec: {0}")]
    InvalidSharding(String),

    #[error("invalid index range [{start}, {end})")]
    InvalidIndexRange { start: usize, end: usize },

    // ── Pipeline description ──────────────────────────────────────────────

    #[error("invalid pipeline description: {0}")]
    InvalidPipeline(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, MeshError>;
