// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::fmt::Debug;

use readahead_core::{Error, Result};
use snafu::location;

/// Source of the buffers that prefetched data is read into.
pub trait BufferAllocator: Debug + Send + Sync {
    /// Allocate a zeroed buffer of exactly `size` bytes.
    ///
    /// The returned buffer is exclusively owned by the caller and freed when it
    /// is dropped.
    fn allocate(&self, size: usize) -> Result<Vec<u8>>;
}

/// Allocator backed by the global heap.
///
/// Reservation is fallible: an allocation the heap refuses, or one larger than
/// the configured `max_allocation_size`, is reported as
/// [`Error::ResourceExhausted`] instead of aborting the process.
#[derive(Debug, Clone, Default)]
pub struct SystemAllocator {
    max_allocation_size: Option<usize>,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_allocation_size(max_allocation_size: Option<usize>) -> Self {
        Self {
            max_allocation_size,
        }
    }

    pub fn max_allocation_size(&self) -> Option<usize> {
        self.max_allocation_size
    }
}

impl BufferAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<Vec<u8>> {
        if let Some(limit) = self.max_allocation_size {
            if size > limit {
                return Err(Error::ResourceExhausted {
                    size,
                    message: format!("exceeds the maximum allocation size of {limit} bytes"),
                    location: location!(),
                });
            }
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|err| Error::ResourceExhausted {
                size,
                message: err.to_string(),
                location: location!(),
            })?;
        buf.resize(size, 0);
        Ok(buf)
    }
}
