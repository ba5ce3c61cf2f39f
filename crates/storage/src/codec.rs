//! Chunk compression codecs

use runtime_core::{Compressor, Error, Result};

/// Compress a chunk buffer
pub fn encode(compressor: Compressor, data: &[u8]) -> Result<Vec<u8>> {
    match compressor {
        Compressor::None => Ok(data.to_vec()),
        Compressor::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compressor::Zstd { level } => zstd::encode_all(data, level).map_err(|e| Error::Storage {
            message: format!("zstd compression failed: {}", e),
        }),
    }
}

/// Decompress a chunk buffer
pub fn decode(compressor: Compressor, data: &[u8]) -> Result<Vec<u8>> {
    match compressor {
        Compressor::None => Ok(data.to_vec()),
        Compressor::Lz4 => {
            lz4_flex::decompress_size_prepended(data).map_err(|e| Error::Storage {
                message: format!("lz4 decompression failed: {}", e),
            })
        }
        Compressor::Zstd { .. } => zstd::decode_all(data).map_err(|e| Error::Storage {
            message: format!("zstd decompression failed: {}", e),
        }),
    }
}
