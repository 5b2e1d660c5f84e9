// Pipeline stage and schedule model consumed by the cross-mesh communicator.
//
// Placement and dependencies are decided elsewhere; this crate only carries
// them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::array::Var;
use crate::config::ReshardConfig;
use crate::error::{MeshError, Result};
use crate::mesh::Mesh;
use crate::sharding::ShardingSpec;

// ── Pipeline Stage ───────────────────────────────────────────────────────────

/// One sharded stage: its inputs and outputs with the shardings the
/// compilation backend chose for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub invars: Vec<Var>,
    pub outvars: Vec<Var>,
    pub input_sharding_specs: Vec<ShardingSpec>,
    pub output_sharding_specs: Vec<ShardingSpec>,
}

impl PipelineStage {
    pub fn validate(&self) -> Result<()> {
        if self.invars.len() != self.input_sharding_specs.len() {
            return Err(MeshError::InvalidPipeline(format!(
                "stage '{}' has {} inputs but {} input sharding specs",
                self.name,
                self.invars.len(),
                self.input_sharding_specs.len()
            )));
        }
        if self.outvars.len() != self.output_sharding_specs.len() {
            return Err(MeshError::InvalidPipeline(format!(
                "stage '{}' has {} outputs but {} output sharding specs",
                self.name,
                self.outvars.len(),
                self.output_sharding_specs.len()
            )));
        }
        Ok(())
    }

    /// Position of `var` among this stage's inputs (matched by identity).
    pub fn invar_index(&self, var: &Var) -> Option<usize> {
        self.invars.iter().position(|v| v == var)
    }
}

// ── Pipeline Schedule ────────────────────────────────────────────────────────

/// Stage placement and inter-stage dependencies.
///
/// `dependency[dst][src] > 0` means stage `dst` consumes outputs of `src`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSchedule {
    pub meshes: Vec<Mesh>,
    pub stage_placement: Vec<usize>,
    pub dependency: Vec<Vec<u32>>,
}

impl PipelineSchedule {
    pub fn num_mesh(&self) -> usize {
        self.meshes.len()
    }

    /// Mesh index a stage runs on.
    pub fn stage_placement(&self, stage_index: usize) -> Option<usize> {
        self.stage_placement.get(stage_index).copied()
    }

    pub fn validate(&self, num_stages: usize) -> Result<()> {
        if self.stage_placement.len() != num_stages {
            return Err(MeshError::InvalidPipeline(format!(
                "{} stage placements for {num_stages} stages",
                self.stage_placement.len()
            )));
        }
        if self.dependency.len() != num_stages
            || self.dependency.iter().any(|row| row.len() != num_stages)
        {
            return Err(MeshError::InvalidPipeline(format!(
                "dependency matrix must be {num_stages}x{num_stages}"
            )));
        }
        if let Some(bad) = self.stage_placement.iter().find(|m| **m >= self.meshes.len()) {
            return Err(MeshError::InvalidPipeline(format!(
                "stage placed on mesh {bad}, but only {} meshes exist",
                self.meshes.len()
            )));
        }
        for (i, mesh) in self.meshes.iter().enumerate() {
            if mesh.mesh_id != i {
                return Err(MeshError::InvalidPipeline(format!(
                    "mesh at position {i} has id {}",
                    mesh.mesh_id
                )));
            }
        }
        Ok(())
    }

    /// `(src_stage, dst_stage)` pairs with a dependency, row-major over
    /// `(dst, src)`.
    pub fn dependent_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (dst, row) in self.dependency.iter().enumerate() {
            for (src, dep) in row.iter().enumerate() {
                if *dep > 0 {
                    pairs.push((src, dst));
                }
            }
        }
        pairs
    }
}

// ── Pipeline Description ─────────────────────────────────────────────────────

/// Everything the communicator needs, loadable from one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDescription {
    pub stages: Vec<PipelineStage>,
    pub schedule: PipelineSchedule,
    #[serde(default)]
    pub config: ReshardConfig,
}

impl PipelineDescription {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let desc: Self =
            serde_json::from_str(data).map_err(|e| MeshError::Serialization(e.to_string()))?;
        desc.validate()?;
        Ok(desc)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| MeshError::InvalidPipeline(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&data)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| MeshError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        for stage in &self.stages {
            stage.validate()?;
        }
        self.schedule.validate(self.stages.len())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
