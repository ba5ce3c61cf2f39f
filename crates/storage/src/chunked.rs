//! Chunked N-dimensional array store
//!
//! An array lives under a prefix as a `.zarray` JSON metadata object plus one
//! object per chunk, keyed by its grid index joined with `.` (`0.3.1`; a
//! rank-0 array has the single chunk `0`). Every chunk object holds the full
//! chunk in C order, compressed; chunks on the trailing edge are padded with
//! zeros. Chunks that were never written read back as zeros.

use std::ops::Range;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use runtime_core::array::{copy_block, num_elements};
use runtime_core::{Compressor, DType, Error, NdArray, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::codec;
use crate::ScopedStorage;

/// Name of the metadata object inside an array prefix
pub const METADATA_FILE: &str = ".zarray";

/// Stored array description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: DType,
    pub compressor: Compressor,
}

impl ArrayMetadata {
    pub fn new(
        shape: Vec<usize>,
        chunks: Vec<usize>,
        dtype: DType,
        compressor: Compressor,
    ) -> Result<Self> {
        let metadata = Self {
            shape,
            chunks,
            dtype,
            compressor,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> Result<()> {
        if self.chunks.len() != self.shape.len() || self.chunks.iter().any(|&c| c == 0) {
            return Err(Error::invalid_spec(format!(
                "chunk shape {:?} invalid for array shape {:?}",
                self.chunks, self.shape
            )));
        }
        Ok(())
    }

    /// Number of chunks along each axis
    pub fn grid(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(&dim, &chunk)| dim.div_ceil(chunk))
            .collect()
    }

    /// Decoded size of one chunk in bytes
    pub fn chunk_nbytes(&self) -> usize {
        num_elements(&self.chunks) * self.dtype.itemsize()
    }

    /// Object key of the chunk at `index`
    pub fn chunk_key(index: &[usize]) -> String {
        if index.is_empty() {
            return "0".to_string();
        }
        index
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Grid indices of every chunk overlapping `ranges`
    fn overlapping_chunks(&self, ranges: &[Range<usize>]) -> Vec<Vec<usize>> {
        let mut indices: Vec<Vec<usize>> = vec![Vec::new()];
        for (range, &chunk) in ranges.iter().zip(&self.chunks) {
            let first = range.start / chunk;
            let last = (range.end - 1) / chunk;
            indices = indices
                .into_iter()
                .flat_map(|prefix| {
                    (first..=last).map(move |i| {
                        let mut index = prefix.clone();
                        index.push(i);
                        index
                    })
                })
                .collect();
        }
        indices
    }

    fn check_ranges(&self, ranges: &[Range<usize>]) -> Result<()> {
        if ranges.len() != self.shape.len()
            || ranges
                .iter()
                .zip(&self.shape)
                .any(|(r, &dim)| r.start > r.end || r.end > dim)
        {
            return Err(Error::InvalidArray {
                message: format!(
                    "region {:?} out of bounds for stored shape {:?}",
                    ranges, self.shape
                ),
            });
        }
        Ok(())
    }
}

/// Intersection of a chunk with a region
struct Overlap {
    key: String,
    /// Offset of the overlap within the chunk
    in_chunk: Vec<usize>,
    /// Offset of the overlap within the region
    in_region: Vec<usize>,
    /// Extent of the overlap
    block: Vec<usize>,
    /// Whether the overlap covers every in-bounds element of the chunk
    covers_chunk: bool,
}

impl Overlap {
    fn new(metadata: &ArrayMetadata, index: &[usize], ranges: &[Range<usize>]) -> Self {
        let rank = index.len();
        let mut in_chunk = Vec::with_capacity(rank);
        let mut in_region = Vec::with_capacity(rank);
        let mut block = Vec::with_capacity(rank);
        let mut covers_chunk = true;

        for axis in 0..rank {
            let origin = index[axis] * metadata.chunks[axis];
            let valid_end = (origin + metadata.chunks[axis]).min(metadata.shape[axis]);
            let lo = origin.max(ranges[axis].start);
            let hi = valid_end.min(ranges[axis].end);
            covers_chunk &= lo == origin && hi == valid_end;
            in_chunk.push(lo - origin);
            in_region.push(lo - ranges[axis].start);
            block.push(hi - lo);
        }

        Self {
            key: ArrayMetadata::chunk_key(index),
            in_chunk,
            in_region,
            block,
            covers_chunk,
        }
    }
}

/// Handle on a stored chunked array
#[derive(Debug, Clone)]
pub struct ChunkedArray {
    storage: ScopedStorage,
    metadata: ArrayMetadata,
    io_concurrency: usize,
}

impl ChunkedArray {
    /// Open the array at `storage`, creating it if absent
    ///
    /// An existing array must agree on shape and dtype; its stored chunking
    /// and compressor are kept.
    #[instrument(skip(storage, metadata), fields(location = %storage.location()))]
    pub async fn create(
        storage: ScopedStorage,
        metadata: ArrayMetadata,
        io_concurrency: usize,
    ) -> Result<Self> {
        metadata.validate()?;
        match storage.read(METADATA_FILE).await {
            Ok(raw) => {
                let existing: ArrayMetadata = serde_json::from_slice(&raw)?;
                if existing.shape != metadata.shape || existing.dtype != metadata.dtype {
                    return Err(Error::invalid_spec(format!(
                        "array at {} exists with shape {:?} and dtype {}, requested {:?} and {}",
                        storage.location(),
                        existing.shape,
                        existing.dtype,
                        metadata.shape,
                        metadata.dtype
                    )));
                }
                Ok(Self::from_parts(storage, existing, io_concurrency))
            }
            Err(Error::StoragePathNotFound { .. }) => {
                storage.create_dir("").await?;
                storage
                    .write(METADATA_FILE, Bytes::from(serde_json::to_vec(&metadata)?))
                    .await?;
                debug!(shape = ?metadata.shape, chunks = ?metadata.chunks, "Created array");
                Ok(Self::from_parts(storage, metadata, io_concurrency))
            }
            Err(e) => Err(e),
        }
    }

    /// Open an existing array
    pub async fn open(storage: ScopedStorage, io_concurrency: usize) -> Result<Self> {
        let raw = match storage.read(METADATA_FILE).await {
            Ok(raw) => raw,
            Err(Error::StoragePathNotFound { .. }) => {
                return Err(Error::not_found(format!(
                    "no array metadata at {}",
                    storage.location()
                )))
            }
            Err(e) => return Err(e),
        };
        let metadata: ArrayMetadata = serde_json::from_slice(&raw)?;
        metadata.validate()?;
        Ok(Self::from_parts(storage, metadata, io_concurrency))
    }

    fn from_parts(storage: ScopedStorage, metadata: ArrayMetadata, io_concurrency: usize) -> Self {
        Self {
            storage,
            metadata,
            io_concurrency: io_concurrency.max(1),
        }
    }

    pub fn metadata(&self) -> &ArrayMetadata {
        &self.metadata
    }

    pub fn shape(&self) -> &[usize] {
        &self.metadata.shape
    }

    /// Read and decode one chunk, or `None` if it was never written
    async fn load_chunk(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let raw = match self.storage.read(key).await {
            Ok(raw) => raw,
            Err(Error::StoragePathNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let compressor = self.metadata.compressor;
        let expected = self.metadata.chunk_nbytes();
        let location = self.storage.location().to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let decoded = codec::decode(compressor, &raw)?;
            if decoded.len() != expected {
                return Err(Error::CheckpointCorrupted {
                    path: format!("{}/{}", location, key),
                    reason: format!("chunk holds {} bytes, expected {}", decoded.len(), expected),
                });
            }
            Ok(Some(decoded))
        })
        .await?
    }

    /// Write `array` into the stored array with its origin at `start`
    #[instrument(skip(self, array), fields(location = %self.storage.location(), size_bytes = array.nbytes()))]
    pub async fn write_region(&self, start: &[usize], array: &NdArray) -> Result<()> {
        if array.dtype() != self.metadata.dtype {
            return Err(Error::InvalidArray {
                message: format!(
                    "cannot write {} data into {} array",
                    array.dtype(),
                    self.metadata.dtype
                ),
            });
        }
        if start.len() != array.rank() {
            return Err(Error::InvalidArray {
                message: format!("origin {:?} does not match rank {}", start, array.rank()),
            });
        }
        let ranges: Vec<Range<usize>> = start
            .iter()
            .zip(array.shape())
            .map(|(&s, &len)| s..s + len)
            .collect();
        self.metadata.check_ranges(&ranges)?;
        if array.num_elements() == 0 {
            return Ok(());
        }

        let chunks = self.metadata.overlapping_chunks(&ranges);
        debug!(chunks = chunks.len(), "Writing region");

        stream::iter(chunks.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(self.io_concurrency, |index| {
                let overlap = Overlap::new(&self.metadata, &index, &ranges);
                self.write_chunk(overlap, array)
            })
            .await
    }

    async fn write_chunk(&self, overlap: Overlap, array: &NdArray) -> Result<()> {
        let existing = if overlap.covers_chunk {
            None
        } else {
            self.load_chunk(&overlap.key).await?
        };

        let chunk_shape = self.metadata.chunks.clone();
        let chunk_nbytes = self.metadata.chunk_nbytes();
        let itemsize = self.metadata.dtype.itemsize();
        let compressor = self.metadata.compressor;
        let src = array.data().clone();
        let src_shape = array.shape().to_vec();
        let Overlap {
            key,
            in_chunk,
            in_region,
            block,
            ..
        } = overlap;

        let encoded = tokio::task::spawn_blocking(move || {
            let mut buffer = existing.unwrap_or_else(|| vec![0u8; chunk_nbytes]);
            copy_block(
                &src,
                &src_shape,
                &in_region,
                &mut buffer,
                &chunk_shape,
                &in_chunk,
                &block,
                itemsize,
            );
            codec::encode(compressor, &buffer)
        })
        .await??;

        self.storage.write(&key, Bytes::from(encoded)).await?;
        Ok(())
    }

    /// Read the sub-array selected by `ranges`
    #[instrument(skip(self), fields(location = %self.storage.location()))]
    pub async fn read_region(&self, ranges: &[Range<usize>]) -> Result<NdArray> {
        self.metadata.check_ranges(ranges)?;
        let out_shape: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        let itemsize = self.metadata.dtype.itemsize();
        let out = Mutex::new(vec![0u8; num_elements(&out_shape) * itemsize]);

        if num_elements(&out_shape) > 0 {
            let chunks = self.metadata.overlapping_chunks(ranges);
            debug!(chunks = chunks.len(), "Reading region");

            stream::iter(chunks)
                .map(|index| {
                    let overlap = Overlap::new(&self.metadata, &index, ranges);
                    async move {
                        let chunk = self.load_chunk(&overlap.key).await?;
                        Ok::<_, Error>((overlap, chunk))
                    }
                })
                .buffer_unordered(self.io_concurrency)
                .try_for_each(|(overlap, chunk)| {
                    if let Some(chunk) = chunk {
                        copy_block(
                            &chunk,
                            &self.metadata.chunks,
                            &overlap.in_chunk,
                            &mut out.lock(),
                            &out_shape,
                            &overlap.in_region,
                            &overlap.block,
                            itemsize,
                        );
                    }
                    futures::future::ready(Ok(()))
                })
                .await?;
        }

        NdArray::new(self.metadata.dtype, out_shape, out.into_inner())
    }

    /// Read the whole array
    pub async fn read_all(&self) -> Result<NdArray> {
        let ranges: Vec<Range<usize>> = self.metadata.shape.iter().map(|&d| 0..d).collect();
        self.read_region(&ranges).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStorage, StorageRouter};
    use crate::Location;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn memory_scope() -> ScopedStorage {
        let location = Location::parse("mem://bucket/array").unwrap();
        ScopedStorage::new(Arc::new(MemoryStorage::new()), "array", location)
    }

    fn iota(shape: Vec<usize>) -> NdArray {
        let n = num_elements(&shape) as i32;
        NdArray::from_vec(shape, (0..n).collect::<Vec<i32>>()).unwrap()
    }

    #[test]
    fn test_chunk_keys_and_grid() {
        let metadata =
            ArrayMetadata::new(vec![5, 4], vec![2, 4], DType::F32, Compressor::None).unwrap();
        assert_eq!(metadata.grid(), vec![3, 1]);
        assert_eq!(ArrayMetadata::chunk_key(&[2, 0]), "2.0");
        assert_eq!(ArrayMetadata::chunk_key(&[]), "0");
        assert!(ArrayMetadata::new(vec![4], vec![0], DType::F32, Compressor::None).is_err());
    }

    #[tokio::test]
    async fn test_full_round_trip_with_edge_chunks() {
        let metadata =
            ArrayMetadata::new(vec![5, 3], vec![2, 2], DType::I32, Compressor::Lz4).unwrap();
        let array = ChunkedArray::create(memory_scope(), metadata, 4).await.unwrap();

        let data = iota(vec![5, 3]);
        array.write_region(&[0, 0], &data).await.unwrap();
        assert_eq!(array.read_all().await.unwrap(), data);

        let part = array.read_region(&[3..5, 1..3]).await.unwrap();
        assert_eq!(part.to_vec::<i32>().unwrap(), vec![10, 11, 13, 14]);
    }

    #[tokio::test]
    async fn test_partial_writes_merge_into_chunks() {
        let metadata =
            ArrayMetadata::new(vec![4, 4], vec![4, 4], DType::I32, Compressor::None).unwrap();
        let array = ChunkedArray::create(memory_scope(), metadata, 2).await.unwrap();

        let top = NdArray::from_vec(vec![2, 4], vec![1i32; 8]).unwrap();
        let bottom = NdArray::from_vec(vec![2, 4], vec![2i32; 8]).unwrap();
        array.write_region(&[0, 0], &top).await.unwrap();
        array.write_region(&[2, 0], &bottom).await.unwrap();

        let all = array.read_all().await.unwrap().to_vec::<i32>().unwrap();
        assert_eq!(&all[..8], &[1; 8]);
        assert_eq!(&all[8..], &[2; 8]);
    }

    #[tokio::test]
    async fn test_unwritten_chunks_read_as_zeros() {
        let metadata =
            ArrayMetadata::new(vec![4], vec![2], DType::F32, Compressor::None).unwrap();
        let array = ChunkedArray::create(memory_scope(), metadata, 2).await.unwrap();
        let half = NdArray::from_vec(vec![2], vec![1.0f32, 2.0]).unwrap();
        array.write_region(&[2], &half).await.unwrap();

        let all = array.read_all().await.unwrap().to_vec::<f32>().unwrap();
        assert_eq!(all, vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_rank_zero_array() {
        let metadata = ArrayMetadata::new(vec![], vec![], DType::I64, Compressor::Zstd { level: 1 })
            .unwrap();
        let array = ChunkedArray::create(memory_scope(), metadata, 1).await.unwrap();
        array.write_region(&[], &NdArray::scalar(42i64)).await.unwrap();
        assert_eq!(array.read_all().await.unwrap().to_vec::<i64>().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_create_conflicting_shape() {
        let scope = memory_scope();
        let metadata =
            ArrayMetadata::new(vec![4], vec![4], DType::F32, Compressor::None).unwrap();
        ChunkedArray::create(scope.clone(), metadata, 1).await.unwrap();

        let other = ArrayMetadata::new(vec![8], vec![4], DType::F32, Compressor::None).unwrap();
        assert!(matches!(
            ChunkedArray::create(scope, other, 1).await,
            Err(Error::InvalidSpec { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_layout_and_open() {
        let temp_dir = TempDir::new().unwrap();
        let router = StorageRouter::local();
        let scope = router
            .open_path(temp_dir.path().join("target.kernel").to_str().unwrap())
            .await
            .unwrap();
        let metadata =
            ArrayMetadata::new(vec![2, 2], vec![1, 2], DType::I32, Compressor::Lz4).unwrap();
        let created = ChunkedArray::create(scope.clone(), metadata, 8).await.unwrap();
        created.write_region(&[0, 0], &iota(vec![2, 2])).await.unwrap();

        assert!(temp_dir.path().join("target.kernel/.zarray").exists());
        assert!(temp_dir.path().join("target.kernel/1.0").exists());

        let opened = ChunkedArray::open(scope, 8).await.unwrap();
        assert_eq!(opened.metadata().compressor, Compressor::Lz4);
        assert_eq!(opened.read_all().await.unwrap(), iota(vec![2, 2]));
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let result = ChunkedArray::open(memory_scope(), 1).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
