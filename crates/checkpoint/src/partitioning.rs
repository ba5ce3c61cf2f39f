//! Partitioner collaborator
//!
//! The checkpointer does not decide how arrays are laid out across hosts; it
//! asks a [`Partitioner`] which region of each array this host holds, and
//! which data shard its input pipeline reads.

use regex::Regex;
use runtime_core::{
    AxisSlice, Error, LocalRegion, ProcessIndex, Result, StateDict, Value,
};

/// Per-axis mesh axis assignment; `None` replicates that array axis
pub type PartitionSpec = Vec<Option<String>>;

/// This host's place in the data-parallel input pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    pub shard_id: usize,
    pub num_shards: usize,
    /// Whether this host is the first of the hosts reading the same shard
    pub is_first_host_in_replica_set: bool,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self {
            shard_id: 0,
            num_shards: 1,
            is_first_host_in_replica_set: true,
        }
    }
}

/// Source of per-host array regions
pub trait Partitioner: Send + Sync {
    /// Region of an array of `shape` held by this host under `spec`
    fn local_region(&self, shape: &[usize], spec: &PartitionSpec) -> Result<LocalRegion>;

    /// Partition spec of every leaf; `None` leaves are not partitioned
    fn mesh_axes(&self, state: &StateDict<Value>) -> Result<StateDict<Option<PartitionSpec>>>;

    /// Place restored leaves onto devices
    fn move_to_devices(
        &self,
        state: StateDict<Value>,
        _axes: &StateDict<Option<PartitionSpec>>,
    ) -> Result<StateDict<Value>> {
        Ok(state)
    }

    /// Whether restored parameters must be moved with [`Partitioner::move_to_devices`]
    fn params_on_devices(&self) -> bool {
        false
    }

    fn data_layout(&self) -> DataLayout;
}

/// How leaves matching a pattern are partitioned
#[derive(Debug, Clone, PartialEq)]
pub enum AxisRule {
    /// Stored, with every host holding the whole array
    Replicated,

    /// Stored, split along mesh axes
    Sharded(PartitionSpec),

    /// Kept inline in the manifest
    Inline,
}

/// Partitioner over a named, row-major grid of hosts
///
/// Host `process_index` sits at the row-major coordinate of the mesh. An
/// array axis mapped to a mesh axis of size `m` is split into `m` equal
/// blocks, and the host takes the block at its coordinate on that mesh axis.
/// Hosts differing only on mesh axes unused by an array hold replicas of the
/// same region.
#[derive(Debug, Clone)]
pub struct MeshPartitioner {
    mesh: Vec<(String, usize)>,
    process_index: ProcessIndex,
    rules: Vec<(Regex, AxisRule)>,
    data_axis: Option<String>,
}

impl MeshPartitioner {
    pub fn new(mesh: Vec<(String, usize)>, process_index: ProcessIndex) -> Result<Self> {
        let hosts: usize = mesh.iter().map(|(_, size)| *size).product();
        if mesh.iter().any(|(_, size)| *size == 0) || process_index >= hosts {
            return Err(Error::invalid_config(format!(
                "process {} does not fit mesh {:?}",
                process_index, mesh
            )));
        }
        Ok(Self {
            mesh,
            process_index,
            rules: Vec::new(),
            data_axis: None,
        })
    }

    /// Partitioner for a lone host: every array replicated and stored
    pub fn single_host() -> Self {
        Self {
            mesh: Vec::new(),
            process_index: 0,
            rules: Vec::new(),
            data_axis: None,
        }
    }

    /// Add a rule for leaves whose full path matches `pattern`; first match wins
    pub fn with_rule(mut self, pattern: &str, rule: AxisRule) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| Error::invalid_config(format!("bad rule pattern `{}`: {}", pattern, e)))?;
        self.rules.push((regex, rule));
        Ok(self)
    }

    /// Mesh axis the input pipeline is sharded over
    pub fn with_data_axis(mut self, axis: impl Into<String>) -> Self {
        self.data_axis = Some(axis.into());
        self
    }

    /// Coordinate of this host along each mesh axis
    fn coordinates(&self) -> Vec<usize> {
        let mut rest = self.process_index;
        let mut coords = vec![0; self.mesh.len()];
        for (i, (_, size)) in self.mesh.iter().enumerate().rev() {
            coords[i] = rest % size;
            rest /= size;
        }
        coords
    }

    fn mesh_axis(&self, name: &str) -> Result<usize> {
        self.mesh
            .iter()
            .position(|(axis, _)| axis == name)
            .ok_or_else(|| Error::invalid_spec(format!("unknown mesh axis `{}`", name)))
    }
}

impl Partitioner for MeshPartitioner {
    fn local_region(&self, shape: &[usize], spec: &PartitionSpec) -> Result<LocalRegion> {
        if spec.len() != shape.len() {
            return Err(Error::invalid_spec(format!(
                "partition spec {:?} does not match shape {:?}",
                spec, shape
            )));
        }

        let coords = self.coordinates();
        let mut used = vec![false; self.mesh.len()];
        let mut slices = Vec::with_capacity(shape.len());

        for (&dim, axis) in shape.iter().zip(spec) {
            let Some(name) = axis else {
                slices.push(AxisSlice::Full);
                continue;
            };
            let mesh_axis = self.mesh_axis(name)?;
            if used[mesh_axis] {
                return Err(Error::invalid_spec(format!(
                    "mesh axis `{}` used twice in {:?}",
                    name, spec
                )));
            }
            used[mesh_axis] = true;

            let parts = self.mesh[mesh_axis].1;
            if dim % parts != 0 {
                return Err(Error::invalid_spec(format!(
                    "axis of size {} cannot be split {} ways",
                    dim, parts
                )));
            }
            if parts == 1 {
                slices.push(AxisSlice::Full);
            } else {
                let block = dim / parts;
                let start = coords[mesh_axis] * block;
                slices.push(AxisSlice::Range {
                    start,
                    stop: start + block,
                });
            }
        }

        let mut replica_id = 0;
        for (i, (_, size)) in self.mesh.iter().enumerate() {
            if !used[i] {
                replica_id = replica_id * size + coords[i];
            }
        }

        Ok(LocalRegion::new(slices, replica_id))
    }

    fn mesh_axes(&self, state: &StateDict<Value>) -> Result<StateDict<Option<PartitionSpec>>> {
        Ok(state
            .iter()
            .map(|(name, value)| {
                let axes = value.shape().and_then(|shape| {
                    let rule = self
                        .rules
                        .iter()
                        .find(|(pattern, _)| pattern.is_match(name))
                        .map(|(_, rule)| rule)
                        .unwrap_or(&AxisRule::Replicated);
                    match rule {
                        AxisRule::Replicated => Some(vec![None; shape.len()]),
                        AxisRule::Sharded(spec) => Some(spec.clone()),
                        AxisRule::Inline => None,
                    }
                });
                (name.clone(), axes)
            })
            .collect())
    }

    fn data_layout(&self) -> DataLayout {
        let Some(axis) = self.data_axis.as_deref() else {
            return DataLayout {
                is_first_host_in_replica_set: self.process_index == 0,
                ..DataLayout::default()
            };
        };
        let coords = self.coordinates();
        match self.mesh_axis(axis) {
            Ok(index) => DataLayout {
                shard_id: coords[index],
                num_shards: self.mesh[index].1,
                is_first_host_in_replica_set: coords
                    .iter()
                    .enumerate()
                    .all(|(i, &c)| i == index || c == 0),
            },
            Err(_) => DataLayout::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::{NdArray, Scalar};

    fn mesh(process_index: usize) -> MeshPartitioner {
        MeshPartitioner::new(
            vec![("data".to_string(), 2), ("model".to_string(), 2)],
            process_index,
        )
        .unwrap()
    }

    #[test]
    fn test_model_sharded_region() {
        let spec = vec![None, Some("model".to_string())];
        // process 3 sits at data=1, model=1
        let region = mesh(3).local_region(&[4, 8], &spec).unwrap();
        assert_eq!(
            region.slices,
            vec![AxisSlice::Full, AxisSlice::Range { start: 4, stop: 8 }]
        );
        assert_eq!(region.replica_id, 1);

        let region = mesh(1).local_region(&[4, 8], &spec).unwrap();
        assert_eq!(region.replica_id, 0);
    }

    #[test]
    fn test_fully_sharded_has_no_replicas() {
        let spec = vec![Some("data".to_string()), Some("model".to_string())];
        for process in 0..4 {
            let region = mesh(process).local_region(&[4, 4], &spec).unwrap();
            assert_eq!(region.replica_id, 0);
        }
    }

    #[test]
    fn test_invalid_specs() {
        let m = mesh(0);
        assert!(m.local_region(&[3], &vec![Some("model".to_string())]).is_err());
        assert!(m.local_region(&[4], &vec![Some("expert".to_string())]).is_err());
        assert!(m.local_region(&[4], &vec![None, None]).is_err());
        assert!(MeshPartitioner::new(vec![("data".to_string(), 2)], 2).is_err());
    }

    #[test]
    fn test_mesh_axes_rules() {
        let partitioner = mesh(0)
            .with_rule(".*/kernel", AxisRule::Sharded(vec![None, Some("model".to_string())]))
            .unwrap()
            .with_rule("state/.*", AxisRule::Inline)
            .unwrap();

        let mut state = StateDict::new();
        state.insert(
            "target/dense/kernel",
            Value::Array(NdArray::zeros(runtime_core::DType::F32, vec![2, 4])),
        );
        state.insert(
            "target/dense/bias",
            Value::Array(NdArray::zeros(runtime_core::DType::F32, vec![4])),
        );
        state.insert(
            "state/counter",
            Value::Array(NdArray::zeros(runtime_core::DType::I32, vec![1])),
        );
        state.insert("state/step", Value::Scalar(Scalar::Int(1)));

        let axes = partitioner.mesh_axes(&state).unwrap();
        assert_eq!(
            axes.get("target/dense/kernel").unwrap(),
            &Some(vec![None, Some("model".to_string())])
        );
        assert_eq!(axes.get("target/dense/bias").unwrap(), &Some(vec![None]));
        assert_eq!(axes.get("state/counter").unwrap(), &None);
        assert_eq!(axes.get("state/step").unwrap(), &None);
    }

    #[test]
    fn test_data_layout() {
        let layout = mesh(3).with_data_axis("data").data_layout();
        assert_eq!(layout.shard_id, 1);
        assert_eq!(layout.num_shards, 2);
        assert!(!layout.is_first_host_in_replica_set);

        let layout = mesh(2).with_data_axis("data").data_layout();
        assert!(layout.is_first_host_in_replica_set);

        assert_eq!(MeshPartitioner::single_host().data_layout(), DataLayout::default());
    }
}
