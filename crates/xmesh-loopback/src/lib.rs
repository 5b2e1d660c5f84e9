//! `xmesh-loopback`: every mesh worker in one process.
//!
//! Device buffers are host byte tensors and point-to-point traffic goes
//! through a shared in-memory [`Fabric`]. Useful for exercising the full
//! resharding path (planning, registration, replay, allgather) without
//! accelerators, and for checking that bytes arrive where the plan says.

pub mod cluster;
pub mod error;
pub mod fabric;
pub mod tensor;
pub mod worker;

pub use cluster::LoopbackCluster;
pub use error::{LoopbackError, Result};
pub use fabric::{ChannelKey, Fabric};
pub use tensor::HostTensor;
pub use worker::LoopbackWorker;
