//! Greedy load-balanced sender selection.
//!
//! Every (destination replica, source slice) pair is fed by the replica holder
//! with the least bytes scheduled to send so far. Ties go to the first holder
//! in replica order, so the same inputs always produce the same plan.

use std::collections::HashMap;

use xmesh_types::{DeviceId, Mesh};

use crate::error::{ReshardError, Result};
use crate::task_spec::{ReshardingStrategy, ReshardingTaskSpec};

/// Bytes attributed to every device as sender and as receiver.
#[derive(Debug, Clone, Default)]
pub struct LoadTracker {
    sender: HashMap<DeviceId, u64>,
    receiver: HashMap<DeviceId, u64>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking every device of `mesh` at zero load.
    pub fn register_mesh(&mut self, mesh: &Mesh) {
        for device in mesh.device_ids() {
            self.sender.entry(device).or_insert(0);
            self.receiver.entry(device).or_insert(0);
        }
    }

    pub fn send_load(&self, device: &DeviceId) -> u64 {
        self.sender.get(device).copied().unwrap_or(0)
    }

    pub fn recv_load(&self, device: &DeviceId) -> u64 {
        self.receiver.get(device).copied().unwrap_or(0)
    }

    pub fn add_send(&mut self, device: DeviceId, bytes: u64) {
        *self.sender.entry(device).or_insert(0) += bytes;
    }

    pub fn add_recv(&mut self, device: DeviceId, bytes: u64) {
        *self.receiver.entry(device).or_insert(0) += bytes;
    }

    pub fn sender_loads(&self) -> &HashMap<DeviceId, u64> {
        &self.sender
    }

    pub fn receiver_loads(&self) -> &HashMap<DeviceId, u64> {
        &self.receiver
    }
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    tracker: LoadTracker,
}

impl LoadBalancer {
    pub fn new(tracker: LoadTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &LoadTracker {
        &self.tracker
    }

    pub fn into_tracker(self) -> LoadTracker {
        self.tracker
    }

    /// Pick a sender for every slice of every destination replica in `spec`,
    /// charging the chosen volumes to the tracker as it goes.
    pub fn assign(&mut self, spec: &ReshardingTaskSpec) -> Result<ReshardingStrategy> {
        let mapping = spec.dst_tile_to_src_tiles_map()?;
        let mut per_tile_plans = Vec::with_capacity(mapping.len());

        for tile_mapping in mapping {
            let receivers = &tile_mapping.dst_tile.replica_devices;
            let mut tile_plan = Vec::with_capacity(receivers.len());
            for receiver in receivers {
                let mut replica_plan = Vec::with_capacity(tile_mapping.src_slices.len());
                for slice in &tile_mapping.src_slices {
                    let Some(sender) = slice
                        .replica_devices()
                        .iter()
                        .copied()
                        .min_by_key(|d| self.tracker.send_load(d))
                    else {
                        return Err(ReshardError::Planning(format!(
                            "source tile {:?} has no replica devices",
                            slice.tile.index
                        )));
                    };
                    let bytes = slice.slice_bytes();
                    self.tracker.add_send(sender, bytes);
                    self.tracker.add_recv(*receiver, bytes);
                    replica_plan.push(sender);
                }
                tile_plan.push(replica_plan);
            }
            per_tile_plans.push(tile_plan);
        }

        Ok(ReshardingStrategy {
            per_tile_plans,
            is_local_allgather: spec.allgather_slice().is_some(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
