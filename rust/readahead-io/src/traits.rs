// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::fmt::Debug;

use readahead_core::Result;

/// A random-access, read-only byte source.
///
/// Reads are positional and blocking. Implementations must be shareable across
/// threads since the prefetch executor issues reads from blocking worker tasks.
pub trait FileHandle: Debug + Send + Sync {
    /// A human readable name for diagnostics.
    fn path(&self) -> &str;

    /// Total size of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Fill all of `buf` with the bytes starting at `offset`.
    ///
    /// A short read is an error.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
}
