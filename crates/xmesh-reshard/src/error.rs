use xmesh_types::MeshError;

#[derive(Debug, thiserror::Error)]
pub enum ReshardError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(
        "incompatible sharding on axis {axis}: length {axis_len} is not divisible into {num_tiles} source tiles"
    )]
    IncompatibleSharding { axis: usize, axis_len: usize, num_tiles: usize },

    #[error("axis {axis} has length 0 and cannot be tiled")]
    EmptyAxis { axis: usize },

    #[error("unsupported mesh dimensionality {0}: only 1D and 2D meshes are supported")]
    UnsupportedMeshDim(usize),

    #[error("resharding strategy has not been generated; run the cross-mesh communicator first")]
    StrategyNotSet,

    #[error("resharding strategy is already set")]
    StrategyAlreadySet,

    #[error("tile mapping has not been computed; call compute_mapping first")]
    MappingNotComputed,

    #[error("source array lives on mesh {actual}, but the task reads from mesh {expected}")]
    MeshMismatch { expected: usize, actual: usize },

    #[error("device {0} is not a member of the collective group")]
    UnknownDevice(String),

    #[error("planning error: {0}")]
    Planning(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ReshardError>;
