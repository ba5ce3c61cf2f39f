//! Core type definitions for the checkpoint engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Training step counter
pub type Step = u64;

/// Index of a host process within the fleet
pub type ProcessIndex = usize;

/// Element type of a stored array
///
/// Serialized with the chunked-array dtype tags (`"<f4"`, `"bfloat16"`, ...)
/// so the same value appears verbatim in array metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "|b1")]
    Bool,
    #[serde(rename = "|u1")]
    U8,
    #[serde(rename = "<u2")]
    U16,
    #[serde(rename = "<i4")]
    I32,
    #[serde(rename = "<i8")]
    I64,
    #[serde(rename = "bfloat16")]
    BFloat16,
    #[serde(rename = "<f4")]
    F32,
    #[serde(rename = "<f8")]
    F64,
}

impl DType {
    /// Size of one element in bytes
    pub fn itemsize(&self) -> usize {
        match self {
            DType::Bool | DType::U8 => 1,
            DType::U16 | DType::BFloat16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Chunked-array dtype tag
    pub fn tag(&self) -> &'static str {
        match self {
            DType::Bool => "|b1",
            DType::U8 => "|u1",
            DType::U16 => "<u2",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::BFloat16 => "bfloat16",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
        }
    }

    /// Parse a chunked-array dtype tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "|b1" => DType::Bool,
            "|u1" => DType::U8,
            "<u2" => DType::U16,
            "<i4" => DType::I32,
            "<i8" => DType::I64,
            "bfloat16" => DType::BFloat16,
            "<f4" => DType::F32,
            "<f8" => DType::F64,
            _ => return None,
        })
    }

    /// Whether this is a floating point type (subject to save/restore casts)
    pub fn is_float(&self) -> bool {
        matches!(self, DType::BFloat16 | DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Non-array leaf value stored inline in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Integer view of the scalar, if it holds one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Codec applied to each stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    /// Raw little-endian bytes
    None,

    /// LZ4 block compression with a prepended size
    Lz4,

    /// Zstandard at the given level
    Zstd { level: i32 },
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor::Lz4
    }
}

impl Compressor {
    /// Codec identifier used in logs
    pub fn id(&self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Lz4 => "lz4",
            Compressor::Zstd { .. } => "zstd",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_tags_round_trip() {
        for dtype in [
            DType::Bool,
            DType::U8,
            DType::U16,
            DType::I32,
            DType::I64,
            DType::BFloat16,
            DType::F32,
            DType::F64,
        ] {
            assert_eq!(DType::from_tag(dtype.tag()), Some(dtype));
        }
        assert_eq!(DType::from_tag("<c8"), None);
    }

    #[test]
    fn test_dtype_serializes_as_tag() {
        let json = serde_json::to_string(&DType::BFloat16).unwrap();
        assert_eq!(json, "\"bfloat16\"");
        let parsed: DType = serde_json::from_str("\"<f4\"").unwrap();
        assert_eq!(parsed, DType::F32);
    }

    #[test]
    fn test_compressor_json() {
        let json = serde_json::to_string(&Compressor::Zstd { level: 3 }).unwrap();
        let parsed: Compressor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Compressor::Zstd { level: 3 });
        assert_eq!(Compressor::default().id(), "lz4");
    }
}
