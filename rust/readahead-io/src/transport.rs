// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! A sequential byte cursor over a file that serves reads from prefetched
//! buffers whenever it can.

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use readahead_core::{Error, Result};
use tracing::debug;

use crate::allocator::{BufferAllocator, SystemAllocator};
use crate::prefetch::{PrefetchConfig, PrefetchExecutor};
use crate::registry::{HeadId, RangeRegistry};
use crate::traits::FileHandle;

/// A single prefetched span that serves every read it covers until cleared.
#[derive(Debug)]
pub struct LegacyPrefetch {
    location: u64,
    buffer: Bytes,
}

impl LegacyPrefetch {
    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn end(&self) -> u64 {
        self.location + self.size()
    }

    fn data_from(&self, pos: u64) -> Option<&[u8]> {
        if pos < self.location || pos >= self.end() {
            return None;
        }
        self.buffer.get((pos - self.location) as usize..)
    }
}

/// How the bytes handed out by a cursor were obtained.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadStats {
    pub legacy_hits: u64,
    pub legacy_bytes: u64,
    pub registry_hits: u64,
    pub registry_bytes: u64,
    pub direct_reads: u64,
    pub direct_bytes: u64,
}

/// Sequential reader over a [FileHandle] with two read-ahead caches.
///
/// Each read starting at the current location is served, in order of
/// preference, from the legacy single-span prefetch, from a materialized head
/// of the range registry, or by a direct read against the file handle. A
/// request that runs off the end of a cached span is served piecewise, so the
/// bytes returned never depend on what was prefetched.
///
/// The cursor is driven by a single decoder and does no locking of its own.
#[derive(Debug)]
pub struct SequentialReadCursor {
    executor: PrefetchExecutor,
    registry: RangeRegistry,
    legacy: Option<LegacyPrefetch>,
    location: u64,
    stats: ReadStats,
}

impl SequentialReadCursor {
    pub fn new(handle: Arc<dyn FileHandle>) -> Self {
        Self::with_config(handle, PrefetchConfig::default())
    }

    pub fn with_config(handle: Arc<dyn FileHandle>, config: PrefetchConfig) -> Self {
        let allocator = Arc::new(SystemAllocator::with_max_allocation_size(
            config.max_allocation_size,
        ));
        Self::with_allocator(handle, allocator, config)
    }

    pub fn with_allocator(
        handle: Arc<dyn FileHandle>,
        allocator: Arc<dyn BufferAllocator>,
        config: PrefetchConfig,
    ) -> Self {
        Self {
            executor: PrefetchExecutor::new(handle, allocator, config.io_parallelism),
            registry: RangeRegistry::new(config.merge_policy),
            legacy: None,
            location: 0,
            stats: ReadStats::default(),
        }
    }

    /// Fill `buf` with the bytes at the current location and advance past them.
    ///
    /// Returns `buf.len()`. On failure the location is left unchanged.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let pos = self.location + filled as u64;
            let dst = &mut buf[filled..];
            filled += if let Some(n) = self.copy_from_legacy(pos, dst) {
                n
            } else if let Some(n) = self.copy_from_registry(pos, dst) {
                n
            } else {
                self.read_direct(pos, dst)?
            };
        }
        self.location += buf.len() as u64;
        Ok(buf.len())
    }

    fn copy_from_legacy(&mut self, pos: u64, dst: &mut [u8]) -> Option<usize> {
        let data = self.legacy.as_ref()?.data_from(pos)?;
        let n = data.len().min(dst.len());
        dst[..n].copy_from_slice(&data[..n]);
        self.stats.legacy_hits += 1;
        self.stats.legacy_bytes += n as u64;
        Some(n)
    }

    fn copy_from_registry(&mut self, pos: u64, dst: &mut [u8]) -> Option<usize> {
        // Heads that have not been read yet are treated as misses
        let data = self.registry.get_read_head(pos)?.data_from(pos)?;
        let n = data.len().min(dst.len());
        dst[..n].copy_from_slice(&data[..n]);
        self.stats.registry_hits += 1;
        self.stats.registry_bytes += n as u64;
        Some(n)
    }

    fn read_direct(&mut self, pos: u64, dst: &mut [u8]) -> Result<usize> {
        let len = dst.len() as u64;
        debug!(location = pos, end = pos + len, size = len, "directly reading");
        let handle = self.executor.handle();
        handle
            .read_exact_at(dst, pos)
            .map_err(|err| Error::read_failed(handle.path(), pos, len, err))?;
        self.stats.direct_reads += 1;
        self.stats.direct_bytes += len;
        Ok(dst.len())
    }

    /// Read `[pos, pos + len)` into the single-span prefetch slot, replacing
    /// whatever it held.
    pub async fn prefetch(&mut self, pos: u64, len: u64) -> Result<()> {
        // Release the old span before allocating the new one
        self.legacy = None;
        if len == 0 {
            return Ok(());
        }
        debug!(location = pos, end = pos + len, size = len, "prefetching single span");
        let buffer = self.executor.fetch(pos, len).await?;
        self.legacy = Some(LegacyPrefetch {
            location: pos,
            buffer,
        });
        Ok(())
    }

    pub fn clear_prefetch(&mut self) {
        self.legacy = None;
    }

    /// Declare that `[pos, pos + len)` will be read soon.
    pub fn register_prefetch(&mut self, pos: u64, len: u64) -> Option<HeadId> {
        self.registry.add_read_head(pos, len, true)
    }

    /// Read every registered range. See [PrefetchExecutor::prefetch].
    pub async fn prefetch_registered(&mut self) -> Result<()> {
        self.executor.prefetch(&mut self.registry).await
    }

    pub fn clear_registered_prefetch(&mut self) {
        self.registry.clear();
    }

    pub fn set_location(&mut self, location: u64) {
        self.location = location;
    }

    pub fn location(&self) -> u64 {
        self.location
    }

    /// Size of the underlying file.
    pub fn size(&self) -> Result<u64> {
        self.executor.handle().size()
    }

    pub fn registry(&self) -> &RangeRegistry {
        &self.registry
    }

    pub fn legacy_prefetch(&self) -> Option<&LegacyPrefetch> {
        self.legacy.as_ref()
    }

    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }

    /// Returns the stats gathered since the last call and resets them.
    pub fn incremental_stats(&mut self) -> ReadStats {
        std::mem::take(&mut self.stats)
    }
}

impl std::io::Read for SequentialReadCursor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.size()?.saturating_sub(self.location);
        let len = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if len == 0 {
            return Ok(0);
        }
        Ok(Self::read(self, &mut buf[..len])?)
    }
}

impl std::io::Seek for SequentialReadCursor {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.location.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size()?.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid seek to {pos:?} from {}", self.location),
            )
        })?;
        self.set_location(target);
        Ok(target)
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        Ok(self.location)
    }
}
