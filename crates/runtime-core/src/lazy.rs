//! Lazily materialized arrays
//!
//! A [`LazyArray`] knows its shape and dtype up front and produces its data
//! on first access. The result is memoized, so clones of one handle share a
//! single fetch.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::OnceCell;

use crate::{DType, Error, NdArray, Result};

type FetchFn = Box<dyn Fn() -> BoxFuture<'static, Result<NdArray>> + Send + Sync>;

struct Inner {
    cell: OnceCell<NdArray>,
    fetch: FetchFn,
}

/// Array whose data is fetched on demand
#[derive(Clone)]
pub struct LazyArray {
    shape: Vec<usize>,
    dtype: DType,
    inner: Arc<Inner>,
}

impl fmt::Debug for LazyArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyArray")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("ready", &self.inner.cell.initialized())
            .finish()
    }
}

impl LazyArray {
    /// Create a handle around an async fetch
    pub fn new<F, Fut>(shape: Vec<usize>, dtype: DType, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NdArray>> + Send + 'static,
    {
        Self {
            shape,
            dtype,
            inner: Arc::new(Inner {
                cell: OnceCell::new(),
                fetch: Box::new(move || Box::pin(fetch())),
            }),
        }
    }

    /// Create a handle around CPU-bound work, run on the blocking pool
    pub fn from_blocking<F>(shape: Vec<usize>, dtype: DType, produce: F) -> Self
    where
        F: Fn() -> Result<NdArray> + Send + Sync + 'static,
    {
        let produce = Arc::new(produce);
        Self::new(shape, dtype, move || {
            let produce = produce.clone();
            async move { tokio::task::spawn_blocking(move || produce()).await? }
        })
    }

    /// Handle over an already materialized array
    pub fn ready(array: NdArray) -> Self {
        Self {
            shape: array.shape().to_vec(),
            dtype: array.dtype(),
            inner: Arc::new(Inner {
                cell: OnceCell::new_with(Some(array)),
                fetch: Box::new(|| {
                    Box::pin(async {
                        Err(Error::Internal {
                            message: "ready array has no fetch".to_string(),
                        })
                    })
                }),
            }),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Size of the materialized data in bytes
    pub fn nbytes(&self) -> u64 {
        (crate::array::num_elements(&self.shape) * self.dtype.itemsize()) as u64
    }

    /// Materialize the array
    pub async fn get_async(&self) -> Result<NdArray> {
        let array = self
            .inner
            .cell
            .get_or_try_init(|| (self.inner.fetch)())
            .await?;
        Ok(array.clone())
    }

    /// Materialize the array, blocking the calling thread
    ///
    /// Inside a tokio runtime this requires the multi-threaded flavor.
    pub fn get(&self) -> Result<NdArray> {
        if let Some(array) = self.inner.cell.get() {
            return Ok(array.clone());
        }
        match Handle::try_current() {
            Ok(handle) => {
                if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
                    return Err(Error::Internal {
                        message: "blocking get() on a current-thread runtime; use get_async()"
                            .to_string(),
                    });
                }
                tokio::task::block_in_place(|| handle.block_on(self.get_async()))
            }
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(self.get_async()),
        }
    }

    /// Derive a handle applying `f` to this array's data
    pub fn map<F>(&self, dtype: DType, f: F) -> LazyArray
    where
        F: Fn(NdArray) -> Result<NdArray> + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        LazyArray::new(self.shape.clone(), dtype, move || {
            let source = source.clone();
            let f = f.clone();
            async move { f(source.get_async().await?) }
        })
    }

    /// Derive a handle that casts to `dtype` on materialization
    pub fn cast(&self, dtype: DType) -> LazyArray {
        if dtype == self.dtype {
            return self.clone();
        }
        self.map(dtype, move |array| Ok(array.cast(dtype)))
    }
}
