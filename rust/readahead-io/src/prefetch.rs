// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Batched reads of every registered range.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{future, stream, FutureExt, StreamExt};
use readahead_core::utils::parse::parse_env_var;
use readahead_core::{Error, Result};
use snafu::location;
use tracing::{debug, instrument};

use crate::allocator::BufferAllocator;
use crate::registry::{HeadId, MergePolicy, RangeRegistry};
use crate::traits::FileHandle;

// Local disks tend to do fine with a few threads. Remote file systems benefit
// from more and can raise this through READAHEAD_IO_THREADS.
pub const DEFAULT_IO_PARALLELISM: usize = 8;

pub const IO_THREADS_ENV: &str = "READAHEAD_IO_THREADS";
pub const MERGE_POLICY_ENV: &str = "READAHEAD_MERGE_POLICY";
pub const MAX_ALLOCATION_ENV: &str = "READAHEAD_MAX_ALLOCATION";

/// Tunables for registering and fetching ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchConfig {
    /// Maximum number of range reads in flight during a prefetch.
    pub io_parallelism: usize,
    /// How registered ranges are merged with their neighbours.
    pub merge_policy: MergePolicy,
    /// Largest single buffer the default allocator hands out.
    pub max_allocation_size: Option<usize>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            io_parallelism: DEFAULT_IO_PARALLELISM,
            merge_policy: MergePolicy::default(),
            max_allocation_size: None,
        }
    }
}

impl PrefetchConfig {
    /// The defaults, overridden by any of `READAHEAD_IO_THREADS`,
    /// `READAHEAD_MERGE_POLICY` and `READAHEAD_MAX_ALLOCATION` that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(io_parallelism) = parse_env_var::<usize>(IO_THREADS_ENV)? {
            if io_parallelism == 0 {
                return Err(Error::InvalidInput {
                    source: format!("{IO_THREADS_ENV} must be at least 1").into(),
                    location: location!(),
                });
            }
            config.io_parallelism = io_parallelism;
        }
        if let Some(merge_policy) = parse_env_var::<MergePolicy>(MERGE_POLICY_ENV)? {
            config.merge_policy = merge_policy;
        }
        if let Some(max_allocation_size) = parse_env_var::<usize>(MAX_ALLOCATION_ENV)? {
            config.max_allocation_size = Some(max_allocation_size);
        }
        Ok(config)
    }

    /// Values below 1 are raised to 1, which reads ranges one at a time.
    pub fn with_io_parallelism(mut self, io_parallelism: usize) -> Self {
        self.io_parallelism = io_parallelism.max(1);
        self
    }

    pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    pub fn with_max_allocation_size(mut self, max_allocation_size: Option<usize>) -> Self {
        self.max_allocation_size = max_allocation_size;
        self
    }
}

/// Reads registered ranges from a file handle into freshly allocated buffers.
///
/// Each range is one blocking read on the tokio blocking pool; up to
/// `io_parallelism` of them run at a time. Callers see a single future that
/// resolves once every range has been read or a read has failed.
#[derive(Debug, Clone)]
pub struct PrefetchExecutor {
    handle: Arc<dyn FileHandle>,
    allocator: Arc<dyn BufferAllocator>,
    io_parallelism: usize,
}

impl PrefetchExecutor {
    pub fn new(
        handle: Arc<dyn FileHandle>,
        allocator: Arc<dyn BufferAllocator>,
        io_parallelism: usize,
    ) -> Self {
        Self {
            handle,
            allocator,
            io_parallelism: io_parallelism.max(1),
        }
    }

    pub fn handle(&self) -> &Arc<dyn FileHandle> {
        &self.handle
    }

    pub fn io_parallelism(&self) -> usize {
        self.io_parallelism
    }

    /// Read every head in `registry` and attach the data to it.
    ///
    /// Once a read fails no further ranges are dispatched. Reads already in
    /// flight are drained so their buffers still reach their heads, then the
    /// first failure is returned. Heads that were never read stay
    /// unmaterialized. Calling this again re-reads every head.
    ///
    /// Reads run on the tokio blocking pool, so this must be awaited from
    /// within a tokio runtime; otherwise it fails with [Error::Internal].
    #[instrument(level = "debug", skip_all, fields(
        path = self.handle.path(),
        num_heads = registry.len(),
        total_size = registry.total_size(),
    ))]
    pub async fn prefetch(&self, registry: &mut RangeRegistry) -> Result<()> {
        let requests: Vec<(HeadId, u64, u64)> = registry
            .iter()
            .map(|(id, head)| (id, head.location(), head.size()))
            .collect();

        let failed = AtomicBool::new(false);
        let failed = &failed;
        let mut reads = stream::iter(requests)
            .take_while(|_| future::ready(!failed.load(Ordering::Acquire)))
            .map(|(id, location, size)| {
                debug!(
                    location,
                    end = location + size,
                    size,
                    "prefetching registered range"
                );
                self.fetch(location, size).map(move |result| {
                    if result.is_err() {
                        failed.store(true, Ordering::Release);
                    }
                    (id, result)
                })
            })
            .buffer_unordered(self.io_parallelism);

        let mut first_err = None;
        while let Some((id, result)) = reads.next().await {
            match result {
                Ok(buffer) => {
                    registry.set_buffer(id, buffer);
                }
                Err(err) => {
                    debug!(%err, "prefetch failed, no further ranges will be read");
                    // This keeps the original error, if present
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Read `size` bytes at `location` into a new buffer.
    ///
    /// Fails with [Error::Internal] when called outside a tokio runtime.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, location: u64, size: u64) -> Result<Bytes> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| Error::Internal {
            message: format!("prefetch reads require a tokio runtime: {err}"),
            location: location!(),
        })?;
        let handle = self.handle.clone();
        let allocator = self.allocator.clone();
        runtime.spawn_blocking(move || {
            read_span(handle.as_ref(), allocator.as_ref(), location, size)
        })
        .await?
    }
}

fn read_span(
    handle: &dyn FileHandle,
    allocator: &dyn BufferAllocator,
    location: u64,
    size: u64,
) -> Result<Bytes> {
    let len = usize::try_from(size).map_err(|err| Error::ResourceExhausted {
        size: usize::MAX,
        message: format!("{size} bytes cannot be addressed: {err}"),
        location: location!(),
    })?;
    let mut buf = allocator.allocate(len)?;
    handle
        .read_exact_at(&mut buf, location)
        .map_err(|err| Error::read_failed(handle.path(), location, size, err))?;
    Ok(Bytes::from(buf))
}
