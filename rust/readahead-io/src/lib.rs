// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Read-ahead for structured binary files.
//!
//! A columnar reader knows, before decoding a row group, which byte ranges it is
//! going to touch. This crate lets it declare those ranges up front
//! ([`RangeRegistry`]), fetch them with a handful of large reads
//! ([`PrefetchExecutor`]) and then pull bytes through a sequential cursor
//! ([`SequentialReadCursor`]) that only falls back to the file handle for bytes
//! nobody declared.

pub mod allocator;
pub mod local;
pub mod prefetch;
pub mod registry;
pub mod testing;
pub mod traits;
pub mod transport;

pub use allocator::{BufferAllocator, SystemAllocator};
pub use local::LocalFileHandle;
pub use prefetch::{PrefetchConfig, PrefetchExecutor, DEFAULT_IO_PARALLELISM};
pub use registry::{HeadId, MergePolicy, RangeRegistry, ReadHead};
pub use traits::FileHandle;
pub use transport::{LegacyPrefetch, ReadStats, SequentialReadCursor};
