//! Storage - Pluggable storage backends for sharded checkpoints
//!
//! Provides async storage operations with support for:
//! - Local filesystem (default feature)
//! - Amazon S3 / S3-compatible storage (with `s3` feature)
//! - An in-memory object store for tests
//!
//! On top of the backends sits a chunked N-dimensional array store used to
//! persist partitioned arrays region by region.
//!
//! # Example
//!
//! ```no_run
//! use storage::{ArrayMetadata, ChunkedArray, StorageRouter};
//! use runtime_core::{Compressor, DType, NdArray};
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let router = StorageRouter::local();
//! let scope = router.open_path("/tmp/checkpoints/checkpoint_1/target.kernel").await?;
//! let metadata = ArrayMetadata::new(vec![4, 4], vec![2, 4], DType::F32, Compressor::Lz4)?;
//! let array = ChunkedArray::create(scope, metadata, 128).await?;
//! array.write_region(&[0, 0], &NdArray::zeros(DType::F32, vec![2, 4])).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod chunked;
pub mod codec;
mod local;
pub mod location;
mod memory;
mod router;

#[cfg(feature = "s3")]
mod s3;

pub use backend::StorageBackend;
pub use chunked::{ArrayMetadata, ChunkedArray};
pub use local::LocalStorage;
pub use location::{is_object_store_path, Location};
pub use memory::MemoryStorage;
pub use router::{MemoryConnector, ObjectStoreConnector, ScopedStorage, StorageRouter};

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Connector, S3Storage};
