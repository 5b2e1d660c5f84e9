pub mod array;
pub mod config;
pub mod error;
pub mod mesh;
pub mod pipeline;
pub mod sharding;

pub use array::{Aval, BufferId, BufferRef, DistributedArray, Dtype, Var};
pub use config::{ReshardConfig, ReshardingMode};
pub use error::MeshError;
pub use mesh::{DeviceId, Mesh, WorkerId};
pub use pipeline::{PipelineDescription, PipelineSchedule, PipelineStage};
pub use sharding::{DimSharding, IndexRange, MeshMapping, ShardingSpec};
