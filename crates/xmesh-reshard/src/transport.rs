//! Wire form of the task lists a worker registers.
//!
//! Workers that live out of process receive their compiled task lists as
//! bincode (standard config) payloads and keep them until replayed.

use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result};
use crate::ids::TaskId;
use crate::worker::{AllGatherSpec, RecvSpec, SendTileSpec};

/// One registered task list as stored by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRecord {
    Send { id: TaskId, group: String, tasks: Vec<SendTileSpec> },
    Recv { id: TaskId, group: String, tasks: Vec<RecvSpec> },
    AllGather { id: TaskId, tasks: Vec<AllGatherSpec> },
}

impl TaskRecord {
    pub fn id(&self) -> TaskId {
        match self {
            Self::Send { id, .. } | Self::Recv { id, .. } | Self::AllGather { id, .. } => *id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ReshardError::Serialization(e.to_string()))
    }

    /// Trailing bytes after the record are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map(|(record, _)| record)
            .map_err(|e| ReshardError::Serialization(e.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::RecvTileSpec;
    use xmesh_types::{Dtype, IndexRange};

    #[test]
    fn recv_record_round_trip() {
        let record = TaskRecord::Recv {
            id: TaskId(7),
            group: "m0:h0:d0,m1:h0:d0".into(),
            tasks: vec![RecvSpec {
                device: 1,
                tile_shape: vec![2, 4],
                dtype: Dtype::F32,
                tiles: vec![RecvTileSpec {
                    indices: vec![IndexRange::full(2), IndexRange { start: 0, end: 2 }],
                    src_rank: 0,
                    src_device: 1,
                }],
            }],
        };
        let bytes = record.to_bytes().unwrap();
        let decoded = TaskRecord::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.id(), TaskId(7));
        match decoded {
            TaskRecord::Recv { tasks, .. } => assert_eq!(tasks[0].tile_shape, vec![2, 4]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn allgather_record_round_trip() {
        let record = TaskRecord::AllGather {
            id: TaskId(3),
            tasks: vec![AllGatherSpec {
                device_ids: vec![0, 2],
                tensor_slices: vec![vec![IndexRange { start: 0, end: 4 }], vec![IndexRange { start: 4, end: 8 }]],
            }],
        };
        let decoded = TaskRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let err = TaskRecord::from_bytes(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, ReshardError::Serialization(_)));
    }
}
