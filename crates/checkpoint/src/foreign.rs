//! Import of checkpoints written by other frameworks
//!
//! Foreign checkpoints are single safetensors files:
//!
//! ```text
//! header_len: u64 LE | JSON header | raw tensor data
//! ```
//!
//! The JSON header maps tensor names to `{dtype, shape, data_offsets}`, with
//! offsets relative to the start of the data section. An optional
//! `__metadata__` entry is ignored.

use bytes::Bytes;
use runtime_core::{DType, Error, NdArray, Result, Scalar, StateDict, Step, TrainState, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use storage::{Location, StorageRouter};
use tracing::{debug, info, warn};

use crate::manifest::MANIFEST_MAGIC;
use crate::param_info::ParameterInfos;
use crate::transform::rename_keys;

/// Name of the tensor holding the training step
pub const STEP_TENSOR: &str = "step";

#[derive(Debug, Deserialize)]
struct TensorHeader {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

fn parse_dtype(name: &str) -> Option<DType> {
    match name {
        "BOOL" => Some(DType::Bool),
        "U8" => Some(DType::U8),
        "U16" => Some(DType::U16),
        "I32" => Some(DType::I32),
        "I64" => Some(DType::I64),
        "BF16" => Some(DType::BFloat16),
        "F32" => Some(DType::F32),
        "F64" => Some(DType::F64),
        _ => None,
    }
}

/// Maps foreign tensor names onto the target state's leaf names
pub trait CheckpointTranslator: Send + Sync {
    fn translate(&self, tensors: StateDict<Value>) -> Result<StateDict<Value>>;
}

/// Translator renaming keys by `(pattern, replacement)` rules
#[derive(Debug, Clone, Default)]
pub struct RegexTranslator {
    rules: Vec<(String, String)>,
}

impl RegexTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.rules.push((pattern.into(), replacement.into()));
        self
    }
}

impl CheckpointTranslator for RegexTranslator {
    fn translate(&self, tensors: StateDict<Value>) -> Result<StateDict<Value>> {
        rename_keys(tensors, &self.rules)
    }
}

/// Parse a safetensors file
///
/// Tensors share `bytes` instead of copying out of it. A rank-0 integer
/// tensor named `step` becomes a scalar.
pub fn parse_safetensors(path: &str, bytes: Bytes) -> Result<StateDict<Value>> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        path: path.to_string(),
        reason,
    };

    if bytes.starts_with(&MANIFEST_MAGIC) {
        return Err(Error::ForeignFormat {
            path: path.to_string(),
            hint: "this is a native checkpoint manifest; restore it directly".to_string(),
        });
    }
    if bytes.len() < 8 {
        return Err(corrupted(format!("file is {} bytes, too short for a header", bytes.len())));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    let data_start = header_len
        .checked_add(8)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| corrupted(format!("header length {} exceeds file size", header_len)))?;

    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&bytes[8..data_start])
        .map_err(|e| corrupted(format!("bad header: {}", e)))?;
    let data = bytes.slice(data_start..);

    let mut tensors = StateDict::new();
    for (name, entry) in raw {
        if name.starts_with("__") {
            continue;
        }
        let header: TensorHeader = serde_json::from_value(entry)
            .map_err(|e| corrupted(format!("bad entry for `{}`: {}", name, e)))?;
        let dtype = parse_dtype(&header.dtype).ok_or_else(|| {
            Error::invalid_spec(format!("tensor `{}` has unsupported dtype {}", name, header.dtype))
        })?;
        let [start, end] = header.data_offsets;
        if start > end || end > data.len() {
            return Err(corrupted(format!(
                "tensor `{}` offsets {:?} exceed data of {} bytes",
                name,
                header.data_offsets,
                data.len()
            )));
        }

        let array = NdArray::new(dtype, header.shape, data.slice(start..end))?;
        let value = if name == STEP_TENSOR && array.rank() == 0 && !dtype.is_float() {
            Value::Scalar(Scalar::Int(array.to_f64_vec()[0] as i64))
        } else {
            Value::Array(array)
        };
        tensors.insert(name, value);
    }

    debug!(path, tensors = tensors.len(), "Parsed safetensors file");
    Ok(tensors)
}

/// Read and parse the foreign checkpoint at `path`
pub async fn read_foreign_checkpoint(router: &StorageRouter, path: &str) -> Result<StateDict<Value>> {
    let location = Location::parse(path)?;
    let (Some(parent), Some(file)) = (location.parent(), location.file_name()) else {
        return Err(Error::not_found(format!("{} does not name a file", path)));
    };
    let bytes = match router.open(&parent).await?.read(&file).await {
        Ok(bytes) => bytes,
        Err(Error::StoragePathNotFound { .. }) => {
            return Err(Error::not_found(format!("no foreign checkpoint at {}", path)))
        }
        Err(e) => return Err(e),
    };
    parse_safetensors(path, bytes)
}

/// Step recorded in a foreign checkpoint, 0 when absent
pub fn foreign_step(tensors: &StateDict<Value>) -> Step {
    match tensors.get(STEP_TENSOR) {
        Some(Value::Scalar(scalar)) => scalar.as_int().map(|s| s.max(0) as Step).unwrap_or(0),
        _ => 0,
    }
}

/// Match foreign tensors against the target layout
///
/// In strict mode every target leaf must be present and every foreign
/// tensor must be used. Otherwise missing leaves keep their template value
/// and unused tensors are logged.
pub fn restore_foreign(
    tensors: StateDict<Value>,
    template: &StateDict<Value>,
    infos: &ParameterInfos,
    strict: bool,
    restore_dtype: Option<DType>,
) -> Result<TrainState> {
    let step = foreign_step(&tensors);
    let mut tensors = tensors;
    let mut state = StateDict::new();

    for (name, info) in infos {
        let Some(info) = info else {
            state.insert(name.clone(), Value::Absent);
            continue;
        };
        let value = match tensors.remove(name) {
            Some(Value::Array(array)) => {
                if array.shape() != info.shape.as_slice() {
                    return Err(Error::ShapeMismatch {
                        name: name.clone(),
                        expected: info.shape.clone(),
                        actual: array.shape().to_vec(),
                    });
                }
                match &info.local_region {
                    Some(region) if !region.is_full(&info.shape) => {
                        Value::Array(array.slice(&region.ranges(&info.shape)?)?)
                    }
                    _ => Value::Array(array),
                }
            }
            Some(other) => other,
            None if strict => {
                return Err(Error::not_found(format!(
                    "foreign checkpoint has no tensor for `{}`",
                    name
                )))
            }
            None => {
                info!(key = %name, "Not restored from foreign checkpoint, keeping initial value");
                template.get(name).cloned().unwrap_or(Value::Absent)
            }
        };
        state.insert(name.clone(), value);
    }

    tensors.remove(STEP_TENSOR);
    if !tensors.is_empty() {
        let unused: Vec<&String> = tensors.keys().collect();
        if strict {
            return Err(Error::invalid_spec(format!(
                "foreign tensors without a target: {:?}",
                unused
            )));
        }
        warn!(?unused, "Foreign tensors without a target");
    }

    if let Some(dtype) = restore_dtype {
        state = state.map(|_, value| value.cast_float(dtype));
    }
    Ok(TrainState::new(step, state))
}
