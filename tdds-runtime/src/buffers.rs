//! Data-buffer pools: eight power-of-two size classes shared by the
//! send path (alloc on write, recycle after transmit) and the receive
//! path (alloc on receive, recycle after decode).

use crate::constraints::PoolConstraints;
use tdds_kernel::error::{DdsError, Result};
use tdds_kernel::pool::{grow_amount, Pool, PoolLimits};

/// Number of size classes.
pub const NUM_CLASSES: usize = 8;

/// Smallest buffer class.
pub const MIN_BUF_SIZE: usize = 64;

struct BufferClass {
    size: usize,
    pool: Pool<Vec<u8>>,
}

/// The process data-buffer pools.
pub struct DataBufferPools {
    classes: Vec<BufferClass>,
}

static CLASS_NAMES: [&str; NUM_CLASSES] = [
    "data-64", "data-128", "data-256", "data-512", "data-1k", "data-2k", "data-4k", "data-8k",
];

impl DataBufferPools {
    pub fn new(constraints: &PoolConstraints) -> DataBufferPools {
        let (min_bytes, max_bytes) = constraints.pool_data;
        let mut classes = Vec::with_capacity(NUM_CLASSES);
        for i in 0..NUM_CLASSES {
            let size = MIN_BUF_SIZE << i;
            // Smaller classes get proportionally more reserved buffers.
            let reserved = std::cmp::max(min_bytes >> (10 + i), 1);
            let extra = if max_bytes > min_bytes {
                std::cmp::max(max_bytes >> (10 + i), reserved) - reserved
            } else {
                0
            };
            classes.push(BufferClass {
                size,
                pool: Pool::new(
                    CLASS_NAMES[i],
                    PoolLimits {
                        reserved,
                        extra,
                        grow: grow_amount(reserved, extra, constraints.growth),
                    },
                ),
            });
        }
        DataBufferPools { classes }
    }

    /// Largest single buffer; bigger payloads are chunked.
    pub fn max_chunk(&self) -> usize {
        self.classes.last().map(|c| c.size).unwrap_or(0)
    }

    /// Take a buffer large enough for `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<Vec<u8>> {
        let class = self
            .classes
            .iter()
            .find(|c| c.size >= size)
            .ok_or_else(|| DdsError::bad_parameter("buffer larger than any class"))?;
        let mut buf = class.pool.alloc()?;
        buf.clear();
        buf.reserve(class.size);
        Ok(buf)
    }

    /// Return a buffer to its class, matched by capacity.
    pub fn recycle(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Some(class) = self.classes.iter().find(|c| c.size >= buf.capacity()) {
            class.pool.free(buf);
        }
        // Oversized foreign buffers just drop.
    }

    /// Log per-class statistics.
    pub fn dump(&self) {
        for c in &self.classes {
            c.pool.dump();
        }
    }

    pub fn class_stats(&self, index: usize) -> Option<tdds_kernel::pool::PoolStats> {
        self.classes.get(index).map(|c| c.pool.stats())
    }
}
