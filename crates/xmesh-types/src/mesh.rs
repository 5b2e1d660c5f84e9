//! Logical description of a device mesh.
//!
//! A mesh is `num_hosts × num_devices_per_host` devices. Devices are always
//! enumerated host-major: flat index `host * num_devices_per_host + device`.
//! Each host is driven by exactly one worker.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// One device: `(mesh, host, local device index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub mesh_id: usize,
    pub host: usize,
    pub device: usize,
}

impl DeviceId {
    pub fn new(mesh_id: usize, host: usize, device: usize) -> Self {
        Self { mesh_id, host, device }
    }

    pub fn worker(&self) -> WorkerId {
        WorkerId { mesh_id: self.mesh_id, host: self.host }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}:h{}:d{}", self.mesh_id, self.host, self.device)
    }
}

/// The worker process driving one host of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    pub mesh_id: usize,
    pub host: usize,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}:h{}", self.mesh_id, self.host)
    }
}

// ── Mesh ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mesh {
    pub mesh_id: usize,
    pub num_hosts: usize,
    pub num_devices_per_host: usize,
}

impl Mesh {
    pub fn new(mesh_id: usize, num_hosts: usize, num_devices_per_host: usize) -> Result<Self> {
        if num_hosts == 0 || num_devices_per_host == 0 {
            return Err(MeshError::EmptyMesh { mesh_id });
        }
        Ok(Self { mesh_id, num_hosts, num_devices_per_host })
    }

    pub fn num_devices(&self) -> usize {
        self.num_hosts * self.num_devices_per_host
    }

    /// All devices in canonical (host-major) order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        (0..self.num_hosts)
            .flat_map(|host| {
                (0..self.num_devices_per_host).map(move |d| DeviceId::new(self.mesh_id, host, d))
            })
            .collect()
    }

    /// Workers in host order.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.num_hosts)
            .map(|host| WorkerId { mesh_id: self.mesh_id, host })
            .collect()
    }

    pub fn device_at(&self, flat_index: usize) -> Option<DeviceId> {
        (flat_index < self.num_devices()).then(|| {
            DeviceId::new(
                self.mesh_id,
                flat_index / self.num_devices_per_host,
                flat_index % self.num_devices_per_host,
            )
        })
    }

    /// Position of `device` in canonical order.
    pub fn flat_index(&self, device: DeviceId) -> Result<usize> {
        if device.mesh_id != self.mesh_id
            || device.host >= self.num_hosts
            || device.device >= self.num_devices_per_host
        {
            return Err(MeshError::UnknownDevice {
                mesh_id: self.mesh_id,
                device: device.to_string(),
            });
        }
        Ok(device.host * self.num_devices_per_host + device.device)
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.flat_index(device).is_ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
