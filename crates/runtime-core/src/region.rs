//! Host-local regions of partitioned arrays

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Extent of a region along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisSlice {
    /// The whole axis
    Full,

    /// Half-open `[start, stop)` interval
    Range { start: usize, stop: usize },
}

impl AxisSlice {
    /// Concrete index range for an axis of size `dim`
    pub fn to_range(&self, dim: usize) -> Range<usize> {
        match *self {
            AxisSlice::Full => 0..dim,
            AxisSlice::Range { start, stop } => start..stop,
        }
    }
}

/// The part of a logical array assigned to this host
///
/// Hosts holding identical copies of a region carry distinct `replica_id`s;
/// only replica 0 writes the region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRegion {
    /// One slice per array axis
    pub slices: Vec<AxisSlice>,

    /// Replica index among hosts holding this region
    pub replica_id: usize,
}

impl LocalRegion {
    /// Create a region from per-axis slices
    pub fn new(slices: Vec<AxisSlice>, replica_id: usize) -> Self {
        Self { slices, replica_id }
    }

    /// Region covering a whole array of the given rank
    pub fn full(rank: usize) -> Self {
        Self {
            slices: vec![AxisSlice::Full; rank],
            replica_id: 0,
        }
    }

    /// Concrete per-axis ranges for an array of `shape`
    pub fn ranges(&self, shape: &[usize]) -> Result<Vec<Range<usize>>> {
        if self.slices.len() != shape.len() {
            return Err(Error::InvalidArray {
                message: format!(
                    "region of rank {} cannot index array of shape {:?}",
                    self.slices.len(),
                    shape
                ),
            });
        }

        self.slices
            .iter()
            .zip(shape)
            .map(|(slice, &dim)| {
                let range = slice.to_range(dim);
                if range.start > range.end || range.end > dim {
                    return Err(Error::InvalidArray {
                        message: format!("slice {:?} out of bounds for axis of size {}", slice, dim),
                    });
                }
                Ok(range)
            })
            .collect()
    }

    /// Shape of the local write for an array of `shape`
    pub fn write_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        Ok(self.ranges(shape)?.into_iter().map(|r| r.len()).collect())
    }

    /// Whether the region spans the entire array
    pub fn is_full(&self, shape: &[usize]) -> bool {
        self.slices
            .iter()
            .zip(shape)
            .all(|(slice, &dim)| slice.to_range(dim) == (0..dim))
    }
}
