//! Byte budget for in-flight array data during a save

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Limits how many bytes of array data are being written at once
///
/// Requests larger than the whole budget are clamped to it, so a single
/// oversized leaf still runs, alone.
#[derive(Debug)]
pub struct ByteBudget {
    total: u64,
    available: Mutex<u64>,
    notify: Notify,
}

impl ByteBudget {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            available: Mutex::new(total),
            notify: Notify::new(),
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn available(&self) -> u64 {
        *self.available.lock()
    }

    /// Wait until `requested` bytes are free and take them
    pub async fn acquire(self: &Arc<Self>, name: &str, requested: u64) -> BytePermit {
        let bytes = if requested > self.total {
            warn!(
                leaf = name,
                requested,
                total = self.total,
                "Request exceeds the byte budget, clamping"
            );
            self.total
        } else {
            requested
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut available = self.available.lock();
                if *available >= bytes {
                    *available -= bytes;
                    debug!(leaf = name, bytes, remaining = *available, "Acquired bytes");
                    return BytePermit {
                        budget: self.clone(),
                        bytes,
                    };
                }
            }

            notified.await;
        }
    }
}

/// Bytes held from a [`ByteBudget`]; released on drop
#[derive(Debug)]
pub struct BytePermit {
    budget: Arc<ByteBudget>,
    bytes: u64,
}

impl BytePermit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BytePermit {
    fn drop(&mut self) {
        *self.budget.available.lock() += self.bytes;
        self.budget.notify.notify_waiters();
    }
}
