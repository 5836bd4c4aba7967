// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Testing utilities
//!
//! When testing code that performs IO, you will often want to make assertions
//! about the number of reads performed and the amount of data read. This module
//! provides [`TrackingFileHandle`], which can wrap any [`FileHandle`], together
//! with an in-memory handle and a handle that injects read failures.

use std::fmt::{Display, Formatter};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use readahead_core::{box_error, Error, Result};
use snafu::location;

use crate::traits::FileHandle;

/// A [FileHandle] over bytes held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryFileHandle {
    path: String,
    data: Bytes,
}

impl InMemoryFileHandle {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl FileHandle for InMemoryFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let start = offset as usize;
        match self.data.get(start..start.saturating_add(buf.len())) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(())
            }
            None => Err(Error::read_failed(
                &self.path,
                offset,
                buf.len() as u64,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read past the end of a {} byte file", self.data.len()),
                )
                .into(),
            )),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct IoStats {
    pub read_iops: u64,
    pub read_bytes: u64,
    pub size_calls: u64,
    pub requests: Vec<Range<u64>>,
}

impl Display for IoStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

/// Assertions on IO statistics.
/// assert_io_eq!(io_stats, read_iops, 1);
/// assert_io_eq!(io_stats, read_bytes, 0, "should be no reads");
#[macro_export]
macro_rules! assert_io_eq {
    ($io_stats:expr, $field:ident, $expected:expr) => {{
        let io_stats = &$io_stats;
        assert_eq!(
            io_stats.$field, $expected,
            "Expected {} to be {}, got {}. Requests: {:?}",
            stringify!($field),
            $expected,
            io_stats.$field,
            io_stats.requests
        );
    }};
    ($io_stats:expr, $field:ident, $expected:expr, $($arg:tt)+) => {{
        let io_stats = &$io_stats;
        assert_eq!(
            io_stats.$field, $expected,
            "Expected {} to be {}, got {}. Requests: {:?} {}",
            stringify!($field),
            $expected,
            io_stats.$field,
            io_stats.requests,
            format_args!($($arg)+)
        );
    }};
}

/// Wraps a [FileHandle] and records every call made through it.
#[derive(Debug, Clone)]
pub struct TrackingFileHandle {
    target: Arc<dyn FileHandle>,
    stats: Arc<Mutex<IoStats>>,
}

impl TrackingFileHandle {
    pub fn new(target: Arc<dyn FileHandle>) -> Self {
        Self {
            target,
            stats: Arc::new(Mutex::new(IoStats::default())),
        }
    }

    fn stats(&self) -> MutexGuard<'_, IoStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the stats gathered since the last call and resets them.
    pub fn incremental_stats(&self) -> IoStats {
        std::mem::take(&mut *self.stats())
    }
}

impl FileHandle for TrackingFileHandle {
    fn path(&self) -> &str {
        self.target.path()
    }

    fn size(&self) -> Result<u64> {
        self.stats().size_calls += 1;
        self.target.size()
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        {
            let mut stats = self.stats();
            stats.read_iops += 1;
            stats.read_bytes += buf.len() as u64;
            stats.requests.push(offset..offset + buf.len() as u64);
        }
        self.target.read_exact_at(buf, offset)
    }
}

/// Wraps a [FileHandle] and fails every read that touches `fail_range`.
#[derive(Debug, Clone)]
pub struct FaultyFileHandle {
    target: Arc<dyn FileHandle>,
    fail_range: Range<u64>,
}

impl FaultyFileHandle {
    pub fn new(target: Arc<dyn FileHandle>, fail_range: Range<u64>) -> Self {
        Self { target, fail_range }
    }
}

impl FileHandle for FaultyFileHandle {
    fn path(&self) -> &str {
        self.target.path()
    }

    fn size(&self) -> Result<u64> {
        self.target.size()
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let end = offset + buf.len() as u64;
        if offset < self.fail_range.end && self.fail_range.start < end {
            return Err(Error::IO {
                source: box_error(std::io::Error::other(format!(
                    "injected failure for {:?}",
                    self.fail_range
                ))),
                location: location!(),
            });
        }
        self.target.read_exact_at(buf, offset)
    }
}

/// `len` bytes of a repeating, offset-dependent pattern.
///
/// Every byte differs from its neighbours so misplaced copies are caught.
pub fn patterned_bytes(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i % 251) as u8 ^ (i / 251) as u8)
        .collect::<Vec<_>>()
        .into()
}
