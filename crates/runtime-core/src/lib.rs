//! Runtime Core - Foundation for the sharded checkpoint engine
//!
//! Provides the error taxonomy, configuration, and the array and state
//! types shared by the storage and checkpoint crates.

pub mod array;
pub mod config;
pub mod error;
pub mod lazy;
pub mod region;
pub mod tree;
pub mod types;

pub use array::{num_elements, Element, NdArray};
pub use config::{CheckpointerConfig, MetricMode, ObjectStoreConfig, RetentionConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use lazy::LazyArray;
pub use region::{AxisSlice, LocalRegion};
pub use tree::{StateDict, TrainState, Value};
pub use types::*;
