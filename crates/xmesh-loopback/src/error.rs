use xmesh_reshard::{ReshardError, TaskId};
use xmesh_types::BufferId;

#[derive(Debug, thiserror::Error)]
pub enum LoopbackError {
    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("no task registered under {0}")]
    UnknownTask(TaskId),

    #[error("{id} is not a {expected} task")]
    WrongTaskKind { id: TaskId, expected: &'static str },

    #[error("{id} has {expected} entries but {actual} buffers were supplied")]
    BufferCountMismatch { id: TaskId, expected: usize, actual: usize },

    #[error("device {device} does not exist on a host with {num_devices} devices")]
    UnknownDevice { device: usize, num_devices: usize },

    #[error("buffer lives on device {actual}, not {expected}")]
    DeviceMismatch { expected: usize, actual: usize },

    #[error("block has rank {actual}, tensor has rank {expected}")]
    RankMismatch { expected: usize, actual: usize },

    #[error("range ending at {end} exceeds axis {axis} of length {len}")]
    OutOfBounds { axis: usize, end: usize, len: usize },

    #[error("expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("worker is not a member of group '{0}'")]
    NotAMember(String),

    #[error("no mesh with id {0}")]
    UnknownMesh(usize),
}

impl From<LoopbackError> for ReshardError {
    fn from(e: LoopbackError) -> Self {
        ReshardError::Worker(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoopbackError>;
