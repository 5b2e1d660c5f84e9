//! Collective groups spanning a source mesh and a destination mesh.
//!
//! Ranks are assigned per worker: source hosts take `[0, n_src)` in host
//! order, destination hosts follow. A device is addressed by its worker's
//! rank and its local device index.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use tracing::debug;
use xmesh_types::{DeviceId, Mesh, WorkerId};

use crate::error::{ReshardError, Result};
use crate::worker::{MeshWorker, PhysicalMesh};

// ── Registry ──────────────────────────────────────────────────────────────────

/// A group declared but not necessarily initialized on its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDeclaration {
    pub name: String,
    pub world_size: usize,
    pub ranks: Vec<usize>,
    pub backend: String,
}

/// Named group declarations visible to every member.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: Mutex<HashMap<String, GroupDeclaration>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, decl: GroupDeclaration) {
        self.lock().insert(decl.name.clone(), decl);
    }

    pub fn get(&self, name: &str) -> Option<GroupDeclaration> {
        self.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<GroupDeclaration> {
        self.lock().remove(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, GroupDeclaration>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── CollectiveGroup ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceSlot {
    rank: usize,
    local_device: usize,
}

#[derive(Debug, Clone)]
pub struct CollectiveGroup {
    name: String,
    backend: String,
    src_mesh: PhysicalMesh,
    dst_mesh: PhysicalMesh,
    devices: HashMap<DeviceId, DeviceSlot>,
    registry: Arc<GroupRegistry>,
}

impl CollectiveGroup {
    pub fn new(
        src_mesh: PhysicalMesh,
        dst_mesh: PhysicalMesh,
        backend: impl Into<String>,
        registry: Arc<GroupRegistry>,
    ) -> Self {
        let mut devices = HashMap::new();
        let mut names = Vec::new();
        for (rank_base, mesh) in [(0, &src_mesh.mesh), (src_mesh.mesh.num_hosts, &dst_mesh.mesh)] {
            for device in mesh.device_ids() {
                devices.insert(
                    device,
                    DeviceSlot { rank: rank_base + device.host, local_device: device.device },
                );
                names.push(device.to_string());
            }
        }
        Self {
            name: names.join(","),
            backend: backend.into(),
            src_mesh,
            dst_mesh,
            devices,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn src_mesh(&self) -> &Mesh {
        &self.src_mesh.mesh
    }

    pub fn dst_mesh(&self) -> &Mesh {
        &self.dst_mesh.mesh
    }

    pub fn world_size(&self) -> usize {
        self.src_mesh.workers.len() + self.dst_mesh.workers.len()
    }

    /// Workers in rank order.
    pub fn mesh_workers(&self) -> impl Iterator<Item = &Arc<dyn MeshWorker>> {
        self.src_mesh.workers.iter().chain(&self.dst_mesh.workers)
    }

    pub fn worker_at_rank(&self, rank: usize) -> Result<&Arc<dyn MeshWorker>> {
        self.mesh_workers()
            .nth(rank)
            .ok_or_else(|| ReshardError::UnknownDevice(format!("rank {rank}")))
    }

    pub fn worker_rank(&self, worker: WorkerId) -> Result<usize> {
        if worker.mesh_id == self.src_mesh.mesh_id() && worker.host < self.src_mesh.mesh.num_hosts {
            Ok(worker.host)
        } else if worker.mesh_id == self.dst_mesh.mesh_id()
            && worker.host < self.dst_mesh.mesh.num_hosts
        {
            Ok(self.src_mesh.mesh.num_hosts + worker.host)
        } else {
            Err(ReshardError::UnknownDevice(worker.to_string()))
        }
    }

    pub fn worker(&self, worker: WorkerId) -> Result<&Arc<dyn MeshWorker>> {
        self.worker_at_rank(self.worker_rank(worker)?)
    }

    /// `(rank, local device index)` of `device`.
    pub fn device_rank(&self, device: DeviceId) -> Result<(usize, usize)> {
        self.slot(device).map(|s| (s.rank, s.local_device))
    }

    pub fn device_worker(&self, device: DeviceId) -> Result<&Arc<dyn MeshWorker>> {
        let slot = self.slot(device)?;
        self.worker_at_rank(slot.rank)
    }

    fn slot(&self, device: DeviceId) -> Result<DeviceSlot> {
        self.devices
            .get(&device)
            .copied()
            .ok_or_else(|| ReshardError::UnknownDevice(device.to_string()))
    }

    fn declaration(&self) -> GroupDeclaration {
        GroupDeclaration {
            name: self.name.clone(),
            world_size: self.world_size(),
            ranks: (0..self.world_size()).collect(),
            backend: self.backend.clone(),
        }
    }

    /// Declare the group; members initialize it on first use.
    pub fn instantiate(&self) {
        self.registry.declare(self.declaration());
        debug!(group = %self.name, world_size = self.world_size(), "collective group declared");
    }

    /// Initialize the group on every member and wait for all of them.
    pub async fn instantiate_now(&self) -> Result<()> {
        let world_size = self.world_size();
        let futures = self.mesh_workers().enumerate().map(|(rank, worker)| {
            worker.init_collective_group(world_size, rank, &self.backend, &self.name)
        });
        try_join_all(futures).await?;
        debug!(group = %self.name, world_size, "collective group created");
        Ok(())
    }

    /// Tear the group down on every member and drop its declaration.
    pub async fn destroy(&self) -> Result<()> {
        debug!(group = %self.name, "recycling collective group");
        let futures = self
            .mesh_workers()
            .map(|worker| worker.destroy_collective_group(&self.name));
        try_join_all(futures).await?;
        self.registry.remove(&self.name);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
