//! Dense little-endian arrays
//!
//! [`NdArray`] keeps its elements as raw little-endian bytes in C order, so
//! that slicing, chunking and dtype reinterpretation work on bytes without
//! per-type generics. Typed access goes through the [`Element`] trait.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::{DType, Error, Result};

/// Primitive element with a fixed little-endian encoding
pub trait Element: Copy + Send + Sync + 'static {
    /// Matching array dtype
    const DTYPE: DType;

    /// Append the little-endian encoding to `out`
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly `DTYPE.itemsize()` bytes
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $size:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $size];
                buf.copy_from_slice(&bytes[..$size]);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(u8, DType::U8, 1);
impl_element!(u16, DType::U16, 2);
impl_element!(i32, DType::I32, 4);
impl_element!(i64, DType::I64, 8);
impl_element!(f32, DType::F32, 4);
impl_element!(f64, DType::F64, 8);

/// Convert an f32 to bfloat16 bits, rounding to nearest even
pub fn f32_to_bf16(value: f32) -> u16 {
    let bits = value.to_bits();
    if value.is_nan() {
        return ((bits >> 16) as u16) | 0x0040;
    }
    let rounding = 0x7fff + ((bits >> 16) & 1);
    (bits.wrapping_add(rounding) >> 16) as u16
}

/// Widen bfloat16 bits to f32
pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// Number of elements of an array with `shape` (1 for rank 0)
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Copy a rectangular block between two C-ordered byte buffers
///
/// `block` elements starting at `src_start` in `src` are copied to
/// `dst_start` in `dst`. Runs along the last axis are copied contiguously.
///
/// # Panics
///
/// Panics if the block does not fit in either buffer.
#[allow(clippy::too_many_arguments)]
pub fn copy_block(
    src: &[u8],
    src_shape: &[usize],
    src_start: &[usize],
    dst: &mut [u8],
    dst_shape: &[usize],
    dst_start: &[usize],
    block: &[usize],
    itemsize: usize,
) {
    let rank = block.len();
    if rank == 0 {
        dst[..itemsize].copy_from_slice(&src[..itemsize]);
        return;
    }
    if block.iter().any(|&b| b == 0) {
        return;
    }

    let src_strides = strides(src_shape);
    let dst_strides = strides(dst_shape);
    let run = block[rank - 1] * itemsize;
    let mut index = vec![0usize; rank - 1];

    loop {
        let mut s = src_start[rank - 1];
        let mut d = dst_start[rank - 1];
        for axis in 0..rank - 1 {
            s += (src_start[axis] + index[axis]) * src_strides[axis];
            d += (dst_start[axis] + index[axis]) * dst_strides[axis];
        }
        let (s, d) = (s * itemsize, d * itemsize);
        dst[d..d + run].copy_from_slice(&src[s..s + run]);

        // Odometer over all axes but the last
        let mut axis = rank - 1;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < block[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

fn read_f64(dtype: DType, bytes: &[u8]) -> f64 {
    match dtype {
        DType::Bool | DType::U8 => bytes[0] as f64,
        DType::U16 => u16::read_le(bytes) as f64,
        DType::I32 => i32::read_le(bytes) as f64,
        DType::I64 => i64::read_le(bytes) as f64,
        DType::BFloat16 => bf16_to_f32(u16::read_le(bytes)) as f64,
        DType::F32 => f32::read_le(bytes) as f64,
        DType::F64 => f64::read_le(bytes),
    }
}

fn write_f64(dtype: DType, value: f64, out: &mut Vec<u8>) {
    match dtype {
        DType::Bool => out.push((value != 0.0) as u8),
        DType::U8 => out.push(value as u8),
        DType::U16 => (value as u16).write_le(out),
        DType::I32 => (value as i32).write_le(out),
        DType::I64 => (value as i64).write_le(out),
        DType::BFloat16 => f32_to_bf16(value as f32).write_le(out),
        DType::F32 => (value as f32).write_le(out),
        DType::F64 => value.write_le(out),
    }
}

/// Dense array of a single dtype in C order
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("nbytes", &self.data.len())
            .finish()
    }
}

impl NdArray {
    /// Wrap raw little-endian bytes, validating their length
    pub fn new(dtype: DType, shape: Vec<usize>, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = num_elements(&shape) * dtype.itemsize();
        if data.len() != expected {
            return Err(Error::InvalidArray {
                message: format!(
                    "{} bytes cannot hold a {} array of shape {:?} ({} bytes)",
                    data.len(),
                    dtype,
                    shape,
                    expected
                ),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Zero-filled array
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = num_elements(&shape) * dtype.itemsize();
        Self {
            dtype,
            shape,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    /// Build an array from typed values
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.itemsize());
        for value in values {
            value.write_le(&mut data);
        }
        Self::new(T::DTYPE, shape, data)
    }

    /// Rank-0 array holding one value
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut data = Vec::with_capacity(T::DTYPE.itemsize());
        value.write_le(&mut data);
        Self {
            dtype: T::DTYPE,
            shape: Vec::new(),
            data: Bytes::from(data),
        }
    }

    /// Decode to typed values; the dtype must match exactly
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::InvalidArray {
                message: format!("cannot view {} array as {}", self.dtype, T::DTYPE),
            });
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.itemsize())
            .map(T::read_le)
            .collect())
    }

    /// Decode any dtype to f64 values
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data
            .chunks_exact(self.dtype.itemsize())
            .map(|bytes| read_f64(self.dtype, bytes))
            .collect()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    /// Size of the element data in bytes
    pub fn nbytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Raw little-endian element bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Convert element values to another dtype
    pub fn cast(&self, dtype: DType) -> NdArray {
        if dtype == self.dtype {
            return self.clone();
        }
        let mut data = Vec::with_capacity(self.num_elements() * dtype.itemsize());
        for bytes in self.data.chunks_exact(self.dtype.itemsize()) {
            write_f64(dtype, read_f64(self.dtype, bytes), &mut data);
        }
        NdArray {
            dtype,
            shape: self.shape.clone(),
            data: Bytes::from(data),
        }
    }

    /// Reinterpret the element bits as another dtype of the same width
    pub fn bitcast(self, dtype: DType) -> Result<NdArray> {
        if dtype.itemsize() != self.dtype.itemsize() {
            return Err(Error::InvalidArray {
                message: format!("cannot bitcast {} to {}", self.dtype, dtype),
            });
        }
        Ok(NdArray {
            dtype,
            shape: self.shape,
            data: self.data,
        })
    }

    /// Copy out the sub-array selected by per-axis ranges
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<NdArray> {
        if ranges.len() != self.rank() {
            return Err(Error::InvalidArray {
                message: format!(
                    "{} ranges cannot slice array of shape {:?}",
                    ranges.len(),
                    self.shape
                ),
            });
        }
        if ranges
            .iter()
            .zip(&self.shape)
            .any(|(r, &dim)| r.start > r.end || r.end > dim)
        {
            return Err(Error::InvalidArray {
                message: format!("ranges {:?} out of bounds for shape {:?}", ranges, self.shape),
            });
        }
        if ranges.iter().zip(&self.shape).all(|(r, &dim)| *r == (0..dim)) {
            return Ok(self.clone());
        }

        let out_shape: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        let starts: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        let itemsize = self.dtype.itemsize();
        let mut out = vec![0u8; num_elements(&out_shape) * itemsize];
        copy_block(
            &self.data,
            &self.shape,
            &starts,
            &mut out,
            &out_shape,
            &vec![0; out_shape.len()],
            &out_shape,
            itemsize,
        );
        NdArray::new(self.dtype, out_shape, out)
    }
}
