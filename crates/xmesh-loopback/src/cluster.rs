//! A set of meshes whose workers all live in this process.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use xmesh_reshard::{MeshWorker, PhysicalMesh, Result, VirtualDistributedArray};
use xmesh_types::{Aval, BufferRef, DeviceId, DistributedArray, IndexRange, Mesh, ShardingSpec, WorkerId};

use crate::error::LoopbackError;
use crate::fabric::Fabric;
use crate::tensor::HostTensor;
use crate::worker::LoopbackWorker;

#[derive(Debug)]
pub struct LoopbackCluster {
    fabric: Arc<Fabric>,
    meshes: Vec<PhysicalMesh>,
    workers: HashMap<WorkerId, Arc<LoopbackWorker>>,
}

impl LoopbackCluster {
    /// One worker per host of every mesh, all sharing one fabric. Meshes
    /// keep the order given.
    pub fn new(meshes: &[Mesh]) -> Result<Self> {
        let fabric = Arc::new(Fabric::new());
        let mut workers = HashMap::new();
        let mut physical = Vec::with_capacity(meshes.len());
        for mesh in meshes {
            let mut handles: Vec<Arc<dyn MeshWorker>> = Vec::with_capacity(mesh.num_hosts);
            for id in mesh.worker_ids() {
                let worker = Arc::new(LoopbackWorker::new(id, mesh.num_devices_per_host, fabric.clone()));
                workers.insert(id, worker.clone());
                handles.push(worker);
            }
            physical.push(PhysicalMesh::new(*mesh, handles)?);
        }
        info!(meshes = meshes.len(), workers = workers.len(), "loopback cluster up");
        Ok(Self { fabric, meshes: physical, workers })
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn physical_meshes(&self) -> &[PhysicalMesh] {
        &self.meshes
    }

    pub fn physical_mesh(&self, mesh_id: usize) -> Option<&PhysicalMesh> {
        self.meshes.iter().find(|m| m.mesh_id() == mesh_id)
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Arc<LoopbackWorker>> {
        self.workers.get(&id)
    }

    fn device_worker(&self, device: DeviceId) -> std::result::Result<&Arc<LoopbackWorker>, LoopbackError> {
        self.worker(device.worker()).ok_or(LoopbackError::UnknownMesh(device.mesh_id))
    }

    /// Contents of one buffer.
    pub fn read(&self, buffer: &BufferRef) -> Result<HostTensor> {
        let tensor = self
            .device_worker(buffer.device)?
            .buffer(buffer.id)
            .ok_or(LoopbackError::UnknownBuffer(buffer.id))?;
        Ok(tensor)
    }

    /// Lay `tensor` out over mesh `mesh_id` according to `spec`.
    pub fn scatter(&self, mesh_id: usize, tensor: &HostTensor, spec: ShardingSpec) -> Result<DistributedArray> {
        let mesh = self.physical_mesh(mesh_id).ok_or(LoopbackError::UnknownMesh(mesh_id))?.mesh;
        let aval = Aval::new(tensor.shape().to_vec(), tensor.dtype());
        let indices = VirtualDistributedArray::new(mesh, aval.clone(), spec.clone())?.indices();

        let mut buffers = Vec::with_capacity(indices.len());
        for (device, ranges) in mesh.device_ids().into_iter().zip(&indices) {
            let shape = ranges.iter().map(IndexRange::len).collect();
            let block = HostTensor::from_bytes(shape, tensor.dtype(), tensor.read_block(ranges)?)?;
            let buffer = BufferRef::new(device, tensor.dtype());
            self.device_worker(device)?.put_buffer(buffer.id, device.device, block)?;
            buffers.push(buffer);
        }
        Ok(DistributedArray::new(mesh_id, aval, spec, buffers, indices))
    }

    /// Reassemble the logical tensor. Replicated tiles are written once per
    /// replica, so any disagreement between replicas shows up as the last
    /// writer winning.
    pub fn gather(&self, array: &DistributedArray) -> Result<HostTensor> {
        let mut out = HostTensor::zeros(array.aval.shape.clone(), array.aval.dtype);
        for (buffer, ranges) in array.buffers.iter().zip(&array.indices) {
            let tensor = self.read(buffer)?;
            out.write_block(ranges, tensor.as_bytes())?;
        }
        Ok(out)
    }

    /// Whether every buffer of `array` holds exactly its slice of `expected`.
    pub fn matches(&self, array: &DistributedArray, expected: &HostTensor) -> Result<bool> {
        for (buffer, ranges) in array.buffers.iter().zip(&array.indices) {
            let held = self.read(buffer)?;
            if held.as_bytes() != expected.read_block(ranges)?.as_slice() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmesh_reshard::{
        CollectiveGroup, CrossMeshCommunicator, GroupRegistry, ImmediateReshardingTask, LoadBalancer,
        PreparedReshardingTask, ReshardError, ReshardingRuntime, ReshardingTask, ReshardingTaskSpec,
        TaskContext, TaskIdSource,
    };
    use xmesh_types::{
        DimSharding::*, Dtype, MeshMapping::*, PipelineSchedule, PipelineStage, ReshardConfig, ReshardingMode, Var,
    };

    async fn task_between(
        cluster: &LoopbackCluster,
        ids: &TaskIdSource,
        (src_mesh, src_spec): (usize, ShardingSpec),
        (dst_mesh, dst_spec): (usize, ShardingSpec),
        aval: &Aval,
        mode: ReshardingMode,
    ) -> ReshardingTask {
        let src = cluster.physical_mesh(src_mesh).unwrap().clone();
        let dst = cluster.physical_mesh(dst_mesh).unwrap().clone();
        let mut spec = ReshardingTaskSpec::new(
            VirtualDistributedArray::new(src.mesh, aval.clone(), src_spec).unwrap(),
            VirtualDistributedArray::new(dst.mesh, aval.clone(), dst_spec).unwrap(),
            None,
        );
        spec.compute_mapping().unwrap();
        let strategy = LoadBalancer::default().assign(&spec).unwrap();
        spec.set_strategy(strategy).unwrap();

        let group = Arc::new(CollectiveGroup::new(src, dst, "nccl", Arc::new(GroupRegistry::new())));
        group.instantiate_now().await.unwrap();
        let ctx = TaskContext::new(Arc::new(spec), group).unwrap();
        match mode {
            ReshardingMode::Immediate => ReshardingTask::Immediate(ImmediateReshardingTask::new(ctx)),
            ReshardingMode::Prepared => {
                ReshardingTask::Prepared(PreparedReshardingTask::new(ctx, ids, true).await.unwrap())
            }
        }
    }

    async fn round_trip(mode: ReshardingMode) {
        let cluster = LoopbackCluster::new(&[Mesh::new(0, 1, 4).unwrap(), Mesh::new(1, 2, 4).unwrap()]).unwrap();
        let ids = TaskIdSource::new();
        let aval = Aval::new(vec![8, 6], Dtype::F32);
        let spec_a = ShardingSpec::new(vec![Chunked(2), Chunked(2)], vec![ShardedAxis(0), ShardedAxis(1)]);
        let spec_b = ShardingSpec::new(vec![Chunked(4), Chunked(2)], vec![ShardedAxis(1), ShardedAxis(0)]);

        let original = HostTensor::iota(vec![8, 6], Dtype::F32);
        let a = cluster.scatter(0, &original, spec_a.clone()).unwrap();

        let forward = task_between(&cluster, &ids, (0, spec_a.clone()), (1, spec_b.clone()), &aval, mode).await;
        let b = forward.execute(&a).await.unwrap();
        assert_eq!(b.mesh_id, 1);
        assert_eq!(b.sharding_spec, spec_b);
        assert!(cluster.matches(&b, &original).unwrap());

        let back = task_between(&cluster, &ids, (1, spec_b), (0, spec_a.clone()), &aval, mode).await;
        let again = back.execute(&b).await.unwrap();
        assert_eq!(again.sharding_spec, spec_a);
        assert!(cluster.matches(&again, &original).unwrap());
        assert_eq!(cluster.gather(&again).unwrap(), original);
        assert_eq!(cluster.fabric().pending(), 0);

        let err = forward.execute(&b).await.unwrap_err();
        assert!(matches!(err, ReshardError::MeshMismatch { expected: 0, actual: 1 }));
    }

    #[tokio::test]
    async fn round_trip_immediate() {
        round_trip(ReshardingMode::Immediate).await;
    }

    #[tokio::test]
    async fn round_trip_prepared() {
        round_trip(ReshardingMode::Prepared).await;
    }

    #[tokio::test]
    async fn prepared_task_replays_with_fresh_buffers() {
        let cluster = LoopbackCluster::new(&[Mesh::new(0, 1, 2).unwrap(), Mesh::new(1, 1, 2).unwrap()]).unwrap();
        let aval = Aval::new(vec![4, 4], Dtype::I32);
        let rows = ShardingSpec::new(vec![Chunked(2), Unsharded], vec![ShardedAxis(0)]);
        let cols = ShardingSpec::new(vec![Unsharded, Chunked(2)], vec![ShardedAxis(0)]);
        let task = task_between(
            &cluster,
            &TaskIdSource::new(),
            (0, rows.clone()),
            (1, cols),
            &aval,
            ReshardingMode::Prepared,
        )
        .await;

        let first = HostTensor::iota(vec![4, 4], Dtype::I32);
        let second = HostTensor::filled(vec![4, 4], Dtype::I32, 7);
        let out_first = task.execute(&cluster.scatter(0, &first, rows.clone()).unwrap()).await.unwrap();
        let out_second = task.execute(&cluster.scatter(0, &second, rows).unwrap()).await.unwrap();

        assert_ne!(out_first.buffers[0].id, out_second.buffers[0].id);
        assert_eq!(cluster.gather(&out_first).unwrap(), first);
        assert_eq!(cluster.gather(&out_second).unwrap(), second);
    }

    fn replicated_consumer() -> (Vec<PipelineStage>, PipelineSchedule) {
        let x = Var::new("x", Aval::new(vec![4, 4], Dtype::F32));
        let stages = vec![
            PipelineStage {
                name: "producer".into(),
                invars: vec![],
                outvars: vec![x.clone()],
                input_sharding_specs: vec![],
                output_sharding_specs: vec![ShardingSpec::new(vec![Chunked(2), Unsharded], vec![ShardedAxis(0)])],
            },
            PipelineStage {
                name: "consumer".into(),
                invars: vec![x],
                outvars: vec![],
                input_sharding_specs: vec![ShardingSpec::replicated(2, 2)],
                output_sharding_specs: vec![],
            },
        ];
        let schedule = PipelineSchedule {
            meshes: vec![Mesh::new(0, 1, 2).unwrap(), Mesh::new(1, 1, 2).unwrap()],
            stage_placement: vec![0, 1],
            dependency: vec![vec![0, 0], vec![1, 0]],
        };
        (stages, schedule)
    }

    #[tokio::test]
    async fn replicated_destination_through_allgather() {
        let (stages, schedule) = replicated_consumer();
        let config = ReshardConfig::default();
        let comm = CrossMeshCommunicator::new(&stages, &schedule, &config).unwrap();
        let cluster = LoopbackCluster::new(&schedule.meshes).unwrap();
        let registry = Arc::new(GroupRegistry::new());
        let runtime = ReshardingRuntime::build(comm, cluster.physical_meshes(), &config, &TaskIdSource::new(), registry.clone())
            .await
            .unwrap();

        let task = runtime.task(0, 1, "x:F32[4, 4]").unwrap();
        assert!(task.spec().allgather_slice().is_some());

        let original = HostTensor::iota(vec![4, 4], Dtype::F32);
        let src = cluster.scatter(0, &original, stages[0].output_sharding_specs[0].clone()).unwrap();
        let out = task.execute(&src).await.unwrap();

        assert_eq!(out.sharding_spec, ShardingSpec::replicated(2, 2));
        for buffer in &out.buffers {
            assert_eq!(cluster.read(buffer).unwrap(), original);
        }

        runtime.destroy().await.unwrap();
        runtime.destroy().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn immediate_mode_stops_before_allgather() {
        let (stages, schedule) = replicated_consumer();
        let config = ReshardConfig {
            mode: ReshardingMode::Immediate,
            instantiate_groups_eagerly: false,
            ..ReshardConfig::default()
        };
        let comm = CrossMeshCommunicator::new(&stages, &schedule, &config).unwrap();
        let cluster = LoopbackCluster::new(&schedule.meshes).unwrap();
        let runtime = ReshardingRuntime::build(
            comm,
            cluster.physical_meshes(),
            &config,
            &TaskIdSource::new(),
            Arc::new(GroupRegistry::new()),
        )
        .await
        .unwrap();

        let original = HostTensor::iota(vec![4, 4], Dtype::F32);
        let src = cluster.scatter(0, &original, stages[0].output_sharding_specs[0].clone()).unwrap();
        let (_, _, _, task) = runtime.tasks().next().unwrap();
        let out = task.execute(&src).await.unwrap();

        assert_ne!(out.sharding_spec, ShardingSpec::replicated(2, 2));
        assert!(cluster.matches(&out, &original).unwrap());
        assert_eq!(cluster.gather(&out).unwrap(), original);
    }

    #[test]
    fn scatter_rejects_unknown_mesh() {
        let cluster = LoopbackCluster::new(&[Mesh::new(0, 1, 1).unwrap()]).unwrap();
        let tensor = HostTensor::zeros(vec![2], Dtype::U8);
        let err = cluster.scatter(3, &tensor, ShardingSpec::replicated(1, 1)).unwrap_err();
        assert!(matches!(err, ReshardError::Worker(_)));
    }
}
