//! Checkpoint manifest encoding
//!
//! The manifest is the `checkpoint` object at the top of a checkpoint
//! directory. Layout:
//!
//! ```text
//! magic "SCKM" | version: u32 LE | bincode body { step, optimizer }
//! ```
//!
//! `optimizer` maps every leaf path to an inline value, a relative storage
//! spec, or an explicit absence.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use runtime_core::{Error, NdArray, Result, Scalar, StateDict, Step};

use crate::storage_spec::StorageSpec;

/// Object name of the manifest inside a checkpoint directory
pub const MANIFEST_FILE: &str = "checkpoint";

/// Magic bytes opening every manifest
pub const MANIFEST_MAGIC: [u8; 4] = *b"SCKM";

/// Manifest format version written by this crate
pub const VERSION: u32 = 3;

/// Oldest manifest version that can be restored
pub const MIN_SUPPORTED_VERSION: u32 = 2;

/// Prefix of the text index files written by TensorFlow savers
pub const FOREIGN_PREFIX: &[u8] = b"model_checkpoint_path";

/// Value stored directly in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InlineValue {
    Array(NdArray),
    Scalar(Scalar),
}

/// One leaf of a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManifestEntry {
    Inline(InlineValue),
    Stored(StorageSpec),
    Absent,
}

#[derive(Serialize, Deserialize)]
struct ManifestBody {
    step: Step,
    optimizer: StateDict<ManifestEntry>,
}

/// Decoded checkpoint manifest
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub version: u32,
    pub step: Step,
    pub optimizer: StateDict<ManifestEntry>,
}

impl Manifest {
    pub fn new(step: Step, optimizer: StateDict<ManifestEntry>) -> Self {
        Self {
            version: VERSION,
            step,
            optimizer,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let body = bincode::serialize(&ManifestBody {
            step: self.step,
            optimizer: self.optimizer.clone(),
        })?;
        let mut buf = Vec::with_capacity(8 + body.len());
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(Bytes::from(buf))
    }

    /// Decode manifest bytes read from `path`
    pub fn decode(path: &str, bytes: &[u8]) -> Result<Manifest> {
        if bytes.starts_with(FOREIGN_PREFIX) {
            return Err(Error::ForeignFormat {
                path: path.to_string(),
                hint: "this is a TensorFlow checkpoint index; import it with \
                       restore_from_foreign_format"
                    .to_string(),
            });
        }
        if bytes.len() < 8 || bytes[..4] != MANIFEST_MAGIC {
            return Err(Error::CheckpointCorrupted {
                path: path.to_string(),
                reason: "missing manifest magic".to_string(),
            });
        }

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version_bytes);
        if version < MIN_SUPPORTED_VERSION {
            return Err(Error::UnsupportedVersion {
                version,
                minimum: MIN_SUPPORTED_VERSION,
            });
        }

        let body: ManifestBody =
            bincode::deserialize(&bytes[8..]).map_err(|e| Error::CheckpointCorrupted {
                path: path.to_string(),
                reason: format!("undecodable manifest body: {}", e),
            })?;

        Ok(Manifest {
            version,
            step: body.step,
            optimizer: body.optimizer,
        })
    }
}
