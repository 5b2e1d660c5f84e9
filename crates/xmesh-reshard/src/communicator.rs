//! Cross-mesh communicator: finds every variable crossing a mesh boundary and
//! plans how to move it.
//!
//! Planning is purely compile-time. Physical meshes, buffers and workers are
//! only touched later, by [`crate::runtime::ReshardingRuntime`].

use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use xmesh_types::{
    DeviceId, DimSharding, Mesh, MeshMapping, PipelineSchedule, PipelineStage, ReshardConfig,
    ShardingSpec, Var,
};

use crate::error::{ReshardError, Result};
use crate::strategy::{LoadBalancer, LoadTracker};
use crate::task_spec::{AllGatherSlice, ReshardingTaskSpec};
use crate::tile::VirtualDistributedArray;

/// Task specs of one (source mesh, destination mesh) pair in insertion order.
#[derive(Debug, Clone, Default)]
pub struct VarSpecMap {
    entries: Vec<(String, ReshardingTaskSpec)>,
}

impl VarSpecMap {
    /// Insert or replace the spec for `key`. A replaced entry keeps its slot.
    pub fn insert(&mut self, key: String, spec: ReshardingTaskSpec) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = spec,
            None => self.entries.push((key, spec)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ReshardingTaskSpec> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReshardingTaskSpec)> {
        self.entries.iter().map(|(k, s)| (k.as_str(), s))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut ReshardingTaskSpec> {
        self.entries.iter_mut().map(|(_, s)| s)
    }

    pub fn into_specs(self) -> impl Iterator<Item = (String, ReshardingTaskSpec)> {
        self.entries.into_iter()
    }
}

#[derive(Debug)]
pub struct CrossMeshCommunicator {
    meshes: Vec<Mesh>,
    /// `specs[src_mesh][dst_mesh]`.
    specs: Vec<Vec<VarSpecMap>>,
    balancer: LoadBalancer,
}

impl CrossMeshCommunicator {
    pub fn new(
        stages: &[PipelineStage],
        schedule: &PipelineSchedule,
        config: &ReshardConfig,
    ) -> Result<Self> {
        schedule.validate(stages.len())?;
        for stage in stages {
            stage.validate()?;
        }

        let num_mesh = schedule.num_mesh();
        let mut specs = vec![vec![VarSpecMap::default(); num_mesh]; num_mesh];
        let mut crossings = 0;

        for (src_stage_index, dst_stage_index) in schedule.dependent_pairs() {
            let src_mesh_index = placement(schedule, src_stage_index)?;
            let dst_mesh_index = placement(schedule, dst_stage_index)?;
            if src_mesh_index == dst_mesh_index {
                continue;
            }
            let src_stage = &stages[src_stage_index];
            let dst_stage = &stages[dst_stage_index];
            let src_mesh = schedule.meshes[src_mesh_index];
            let dst_mesh = schedule.meshes[dst_mesh_index];

            for (var, out_index, in_index) in args_between(src_stage, dst_stage) {
                let src_spec = src_stage.output_sharding_specs[out_index].clone();
                let final_spec = dst_stage.input_sharding_specs[in_index].clone();
                let (dst_spec, allgather_slice) =
                    rewrite_allgather_specs(&final_spec, &dst_mesh, var, config)?;

                let src_array = VirtualDistributedArray::new(src_mesh, var.aval.clone(), src_spec)?;
                let dst_array = VirtualDistributedArray::new(dst_mesh, var.aval.clone(), dst_spec)?;
                let mut spec = ReshardingTaskSpec::new(src_array, dst_array, allgather_slice)
                    .with_output_sharding(final_spec);
                spec.compute_mapping()?;

                debug!(
                    src_mesh = src_mesh_index,
                    dst_mesh = dst_mesh_index,
                    var = %var,
                    spec = %spec,
                    "resharding spec created"
                );
                specs[src_mesh_index][dst_mesh_index].insert(var.to_string(), spec);
                crossings += 1;
            }
        }

        let mut tracker = LoadTracker::new();
        for mesh in &schedule.meshes {
            tracker.register_mesh(mesh);
        }
        let mut balancer = LoadBalancer::new(tracker);
        for row in specs.iter_mut() {
            for map in row.iter_mut() {
                for spec in map.iter_mut() {
                    let strategy = balancer.assign(spec)?;
                    spec.set_strategy(strategy)?;
                }
            }
        }

        info!(meshes = num_mesh, crossings, "cross-mesh communicator planned");
        Ok(Self { meshes: schedule.meshes.clone(), specs, balancer })
    }

    pub fn num_mesh(&self) -> usize {
        self.meshes.len()
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    pub fn resharding_specs(&self, src_mesh: usize, dst_mesh: usize) -> Option<&VarSpecMap> {
        self.specs.get(src_mesh).and_then(|row| row.get(dst_mesh))
    }

    /// Non-empty `(src_mesh, dst_mesh, specs)` triples, row-major.
    pub fn task_spec_iter(&self) -> impl Iterator<Item = (usize, usize, &VarSpecMap)> {
        self.specs.iter().enumerate().flat_map(|(i, row)| {
            row.iter()
                .enumerate()
                .filter(|(_, map)| !map.is_empty())
                .map(move |(j, map)| (i, j, map))
        })
    }

    /// Give up the planned specs, keyed like [`task_spec_iter`](Self::task_spec_iter).
    pub fn into_specs(self) -> Vec<(usize, usize, VarSpecMap)> {
        self.specs
            .into_iter()
            .enumerate()
            .flat_map(|(i, row)| {
                row.into_iter()
                    .enumerate()
                    .filter(|(_, map)| !map.is_empty())
                    .map(move |(j, map)| (i, j, map))
            })
            .collect()
    }

    pub fn sender_loads(&self) -> BTreeMap<DeviceId, u64> {
        self.balancer.tracker().sender_loads().iter().map(|(d, l)| (*d, *l)).collect()
    }

    pub fn receiver_loads(&self) -> BTreeMap<DeviceId, u64> {
        self.balancer.tracker().receiver_loads().iter().map(|(d, l)| (*d, *l)).collect()
    }
}

fn placement(schedule: &PipelineSchedule, stage: usize) -> Result<usize> {
    schedule
        .stage_placement(stage)
        .ok_or_else(|| ReshardError::Planning(format!("stage {stage} has no mesh placement")))
}

/// Variables produced by `src` and consumed by `dst`, in `src` output order,
/// with their output and input positions.
fn args_between<'a>(src: &'a PipelineStage, dst: &PipelineStage) -> Vec<(&'a Var, usize, usize)> {
    src.outvars
        .iter()
        .enumerate()
        .filter_map(|(out_index, var)| dst.invar_index(var).map(|in_index| (var, out_index, in_index)))
        .collect()
}

/// Split an under-sharded destination further so that point-to-point
/// traffic carries each element once, leaving the replication to a local
/// allgather.
///
/// Returns the sharding to transfer into and the allgather step that
/// restores `spec`, or `spec` unchanged and `None`.
pub fn rewrite_allgather_specs(
    spec: &ShardingSpec,
    dst_mesh: &Mesh,
    var: &Var,
    config: &ReshardConfig,
) -> Result<(ShardingSpec, Option<AllGatherSlice>)> {
    let unchanged = Ok((spec.clone(), None));
    if !config.use_scatter_gather {
        return unchanged;
    }

    let num_devices = dst_mesh.num_devices();
    let total = spec.total_sharding();
    if total == num_devices {
        return unchanged;
    }
    if total == 0 || num_devices % total != 0 {
        return Err(ReshardError::Planning(format!(
            "sharding {spec} splits {var} into {total} pieces, which does not divide {num_devices} devices"
        )));
    }
    let extra_sharding = num_devices / total;

    let chunk_dim_to_tensor_dim = spec.chunked_axes();
    // tensor dim -> mesh axis
    let mut shard_axes: BTreeMap<usize, usize> = BTreeMap::new();
    for (mesh_axis, mapping) in spec.mesh_mapping.iter().enumerate() {
        if let MeshMapping::ShardedAxis(k) = mapping {
            if let Some(dim) = chunk_dim_to_tensor_dim.get(*k) {
                shard_axes.insert(*dim, mesh_axis);
            }
        }
    }

    // Gathering across hosts is not supported.
    let first_axis_spans_hosts = match spec.mesh_mapping.first() {
        Some(MeshMapping::ShardedAxis(k)) => chunk_dim_to_tensor_dim
            .get(*k)
            .map(|dim| spec.sharding[*dim].chunks() < dst_mesh.num_hosts)
            .unwrap_or(true),
        _ => true,
    };
    if first_axis_spans_hosts && dst_mesh.num_hosts > 1 {
        return unchanged;
    }

    if shard_axes.len() >= 2 {
        return Err(ReshardError::UnsupportedMeshDim(shard_axes.len() + 1));
    }

    for (dim, dim_spec) in spec.sharding.iter().enumerate() {
        let new_chunks = extra_sharding * dim_spec.chunks();
        if var.aval.shape[dim] % new_chunks != 0 {
            continue;
        }
        if matches!(shard_axes.get(&dim), Some(axis) if *axis != 0) {
            continue;
        }

        let mut sharding = spec.sharding.clone();
        sharding[dim] = DimSharding::Chunked(new_chunks);
        if !shard_axes.contains_key(&dim) {
            let axis = if shard_axes.values().any(|a| *a == 0) { 1 } else { 0 };
            shard_axes.insert(dim, axis);
        }

        // BTreeMap iterates tensor dims ascending, i.e. in chunked-axis order.
        let chunk_of_mesh_axis: BTreeMap<usize, usize> = shard_axes
            .values()
            .enumerate()
            .map(|(chunk, mesh_axis)| (*mesh_axis, chunk))
            .collect();
        let mesh_mapping = (0..2)
            .map(|mesh_axis| match chunk_of_mesh_axis.get(&mesh_axis) {
                Some(chunk) => MeshMapping::ShardedAxis(*chunk),
                None => MeshMapping::Replicated(1),
            })
            .collect();

        let rewritten = ShardingSpec::new(sharding, mesh_mapping);
        debug!(var = %var, from = %spec, to = %rewritten, "destination sharding rewritten for allgather");
        let slice = AllGatherSlice { tensor_axis: dim, mesh_axis: shard_axes[&dim], extra_sharding };
        return Ok((rewritten, Some(slice)));
    }

    warn!(
        var = %var,
        sharding = %spec,
        "resharding task is not fully sharded; this causes redundant communication"
    );
    unchanged
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use xmesh_types::{Aval, DimSharding::*, Dtype, MeshMapping::*};

    fn var(shape: Vec<usize>) -> Var {
        Var::new("x", Aval::new(shape, Dtype::F32))
    }

    fn stage(
        name: &str,
        invars: Vec<(Var, ShardingSpec)>,
        outvars: Vec<(Var, ShardingSpec)>,
    ) -> PipelineStage {
        let (invars, input_sharding_specs) = invars.into_iter().unzip();
        let (outvars, output_sharding_specs) = outvars.into_iter().unzip();
        PipelineStage { name: name.into(), invars, outvars, input_sharding_specs, output_sharding_specs }
    }

    fn rows(n: usize) -> ShardingSpec {
        ShardingSpec::new(vec![Chunked(n), Unsharded], vec![ShardedAxis(0)])
    }

    fn blocks() -> ShardingSpec {
        ShardingSpec::new(vec![Chunked(2), Chunked(2)], vec![ShardedAxis(0), ShardedAxis(1)])
    }

    #[test]
    fn scatter_gather_disabled_keeps_spec() {
        let config = ReshardConfig { use_scatter_gather: false, ..ReshardConfig::default() };
        let spec = ShardingSpec::replicated(2, 4);
        let (out, slice) =
            rewrite_allgather_specs(&spec, &Mesh::new(1, 1, 4).unwrap(), &var(vec![8, 8]), &config).unwrap();
        assert_eq!(out, spec);
        assert!(slice.is_none());
    }

    #[test]
    fn fully_sharded_needs_no_rewrite() {
        let (out, slice) = rewrite_allgather_specs(
            &blocks(),
            &Mesh::new(1, 1, 4).unwrap(),
            &var(vec![4, 4]),
            &ReshardConfig::default(),
        )
        .unwrap();
        assert_eq!(out, blocks());
        assert!(slice.is_none());
    }

    #[test]
    fn fully_replicated_is_split_on_first_divisible_axis() {
        let (out, slice) = rewrite_allgather_specs(
            &ShardingSpec::replicated(2, 4),
            &Mesh::new(1, 1, 4).unwrap(),
            &var(vec![6, 8]),
            &ReshardConfig::default(),
        )
        .unwrap();
        // 6 rows do not split four ways; 8 columns do.
        assert_eq!(out, ShardingSpec::new(vec![Unsharded, Chunked(4)], vec![ShardedAxis(0), Replicated(1)]));
        assert_eq!(slice, Some(AllGatherSlice { tensor_axis: 1, mesh_axis: 0, extra_sharding: 4 }));
    }

    #[test]
    fn partially_replicated_splits_free_axis() {
        let spec = ShardingSpec::new(vec![Chunked(2), Unsharded], vec![Replicated(2), ShardedAxis(0)]);
        let (out, slice) =
            rewrite_allgather_specs(&spec, &Mesh::new(1, 1, 4).unwrap(), &var(vec![8, 4]), &ReshardConfig::default())
                .unwrap();
        assert_eq!(out, ShardingSpec::new(vec![Chunked(2), Chunked(2)], vec![ShardedAxis(1), ShardedAxis(0)]));
        assert_eq!(slice, Some(AllGatherSlice { tensor_axis: 1, mesh_axis: 0, extra_sharding: 2 }));
        out.validate(2, 4).unwrap();
    }

    #[test]
    fn multi_host_replication_is_left_alone() {
        let spec = ShardingSpec::new(vec![Chunked(2), Unsharded], vec![Replicated(2), ShardedAxis(0)]);
        let (out, slice) =
            rewrite_allgather_specs(&spec, &Mesh::new(1, 2, 2).unwrap(), &var(vec![8, 4]), &ReshardConfig::default())
                .unwrap();
        assert_eq!(out, spec);
        assert!(slice.is_none());
    }

    #[test]
    fn indivisible_shapes_warn_and_keep_spec() {
        let spec = ShardingSpec::replicated(2, 4);
        let (out, slice) =
            rewrite_allgather_specs(&spec, &Mesh::new(1, 1, 4).unwrap(), &var(vec![3, 5]), &ReshardConfig::default())
                .unwrap();
        assert_eq!(out, spec);
        assert!(slice.is_none());
    }

    #[test]
    fn two_sharded_axes_are_rejected() {
        let spec = ShardingSpec::new(
            vec![Chunked(2), Chunked(2)],
            vec![ShardedAxis(0), ShardedAxis(1), Replicated(2)],
        );
        let err = rewrite_allgather_specs(
            &spec,
            &Mesh::new(1, 1, 8).unwrap(),
            &var(vec![8, 8]),
            &ReshardConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReshardError::UnsupportedMeshDim(3)));
    }

    fn two_mesh_pipeline(dst_spec: ShardingSpec, dst_mesh: Mesh) -> (Vec<PipelineStage>, PipelineSchedule) {
        let x = var(vec![4, 4]);
        let y = Var::new("y", Aval::new(vec![4, 4], Dtype::F32));
        let stages = vec![
            stage("s0", vec![], vec![(x.clone(), rows(2)), (y.clone(), rows(2))]),
            stage("s1", vec![(y, dst_spec.clone()), (x, dst_spec)], vec![]),
        ];
        let schedule = PipelineSchedule {
            meshes: vec![Mesh::new(0, 1, 2).unwrap(), dst_mesh],
            stage_placement: vec![0, 1],
            dependency: vec![vec![0, 0], vec![1, 0]],
        };
        (stages, schedule)
    }

    #[test]
    fn communicator_plans_each_crossing_var() {
        let (stages, schedule) = two_mesh_pipeline(blocks(), Mesh::new(1, 1, 4).unwrap());
        let comm = CrossMeshCommunicator::new(&stages, &schedule, &ReshardConfig::default()).unwrap();

        let triples: Vec<_> = comm.task_spec_iter().collect();
        assert_eq!(triples.len(), 1);
        let (src, dst, map) = triples[0];
        assert_eq!((src, dst), (0, 1));
        // Source output order, not destination input order.
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["x:F32[4, 4]", "y:F32[4, 4]"]);

        let spec = map.get("x:F32[4, 4]").unwrap();
        assert_eq!(spec.dst_tile_to_src_tiles_map().unwrap().len(), 4);
        assert!(spec.strategy().is_ok());
        assert!(spec.allgather_slice().is_none());

        let loads = comm.sender_loads();
        assert_eq!(loads.len(), 6);
        assert_eq!(loads[&DeviceId::new(0, 0, 0)], 2 * 8 * 4);
        assert_eq!(comm.receiver_loads()[&DeviceId::new(1, 0, 3)], 2 * 4 * 4);
    }

    #[test]
    fn same_mesh_dependencies_are_skipped() {
        let (stages, mut schedule) = two_mesh_pipeline(rows(2), Mesh::new(1, 1, 2).unwrap());
        schedule.stage_placement = vec![0, 0];
        let comm = CrossMeshCommunicator::new(&stages, &schedule, &ReshardConfig::default()).unwrap();
        assert_eq!(comm.task_spec_iter().count(), 0);
    }

    #[test]
    fn replicated_destination_gets_allgather_step() {
        let spec = ShardingSpec::new(vec![Chunked(2), Unsharded], vec![Replicated(2), ShardedAxis(0)]);
        let (stages, schedule) = two_mesh_pipeline(spec.clone(), Mesh::new(1, 1, 4).unwrap());
        let comm = CrossMeshCommunicator::new(&stages, &schedule, &ReshardConfig::default()).unwrap();
        let map = comm.resharding_specs(0, 1).unwrap();
        let planned = map.get("x:F32[4, 4]").unwrap();
        assert!(planned.strategy().unwrap().is_local_allgather);
        assert_eq!(*planned.output_sharding_spec(), spec);
        assert_ne!(*planned.dst_sharding_spec(), spec);
    }

    #[test]
    fn malformed_dependency_matrix_is_rejected() {
        let (stages, mut schedule) = two_mesh_pipeline(blocks(), Mesh::new(1, 1, 4).unwrap());
        schedule.dependency = vec![vec![0, 0, 0], vec![1, 0, 0]];
        let err = CrossMeshCommunicator::new(&stages, &schedule, &ReshardConfig::default()).unwrap_err();
        assert!(matches!(err, ReshardError::Mesh(_)));
    }
}
