//! Turns a planned communicator into executable tasks on physical meshes.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;
use xmesh_types::{ReshardConfig, ReshardingMode};

use crate::collective::{CollectiveGroup, GroupRegistry};
use crate::communicator::CrossMeshCommunicator;
use crate::error::{ReshardError, Result};
use crate::ids::TaskIdSource;
use crate::task::{ImmediateReshardingTask, PreparedReshardingTask, ReshardingTask, TaskContext};
use crate::worker::PhysicalMesh;

/// One executable task per crossing variable, grouped by mesh pair.
#[derive(Debug)]
pub struct ReshardingRuntime {
    groups: BTreeMap<(usize, usize), Arc<CollectiveGroup>>,
    tasks: BTreeMap<(usize, usize), Vec<(String, ReshardingTask)>>,
}

impl ReshardingRuntime {
    /// `meshes[i]` must back mesh `i` of the communicator's schedule.
    pub async fn build(
        communicator: CrossMeshCommunicator,
        meshes: &[PhysicalMesh],
        config: &ReshardConfig,
        ids: &TaskIdSource,
        registry: Arc<GroupRegistry>,
    ) -> Result<Self> {
        for (index, planned) in communicator.meshes().iter().enumerate() {
            match meshes.get(index) {
                Some(physical) if physical.mesh == *planned => {}
                Some(physical) => {
                    return Err(ReshardError::MeshMismatch {
                        expected: planned.mesh_id,
                        actual: physical.mesh_id(),
                    })
                }
                None => {
                    return Err(ReshardError::Planning(format!(
                        "no physical mesh for planned mesh {index}"
                    )))
                }
            }
        }

        let mut groups = BTreeMap::new();
        let mut tasks = BTreeMap::new();
        for (src, dst, specs) in communicator.into_specs() {
            let group = Arc::new(CollectiveGroup::new(
                meshes[src].clone(),
                meshes[dst].clone(),
                config.backend.clone(),
                registry.clone(),
            ));
            if config.instantiate_groups_eagerly {
                group.instantiate_now().await?;
            } else {
                group.instantiate();
            }

            let mut built = Vec::with_capacity(specs.len());
            for (var, spec) in specs.into_specs() {
                let ctx = TaskContext::new(Arc::new(spec), group.clone())?;
                let task = match config.mode {
                    ReshardingMode::Prepared => ReshardingTask::Prepared(
                        PreparedReshardingTask::new(ctx, ids, config.eagerly_create_communicators).await?,
                    ),
                    ReshardingMode::Immediate => ReshardingTask::Immediate(ImmediateReshardingTask::new(ctx)),
                };
                built.push((var, task));
            }
            info!(src_mesh = src, dst_mesh = dst, tasks = built.len(), mode = ?config.mode, "resharding tasks ready");
            groups.insert((src, dst), group);
            tasks.insert((src, dst), built);
        }
        Ok(Self { groups, tasks })
    }

    pub fn task(&self, src_mesh: usize, dst_mesh: usize, var: &str) -> Option<&ReshardingTask> {
        self.tasks
            .get(&(src_mesh, dst_mesh))?
            .iter()
            .find(|(name, _)| name == var)
            .map(|(_, task)| task)
    }

    /// `(src_mesh, dst_mesh, var, task)` in mesh-pair then insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = (usize, usize, &str, &ReshardingTask)> {
        self.tasks.iter().flat_map(|((src, dst), list)| {
            list.iter().map(move |(var, task)| (*src, *dst, var.as_str(), task))
        })
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.values().map(Vec::len).sum()
    }

    pub fn group(&self, src_mesh: usize, dst_mesh: usize) -> Option<&Arc<CollectiveGroup>> {
        self.groups.get(&(src_mesh, dst_mesh))
    }

    /// Tear down every collective group. Safe to call more than once.
    pub async fn destroy(&self) -> Result<()> {
        for group in self.groups.values() {
            group.destroy().await?;
        }
        Ok(())
    }
}
