// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Positional reads against the local file system

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;

// TODO: Clean up windows/unix stuff
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

use readahead_core::{box_error, Error, Result};
use snafu::location;
use tracing::instrument;

use crate::traits::FileHandle;

/// [FileHandle] for the local file system.
#[derive(Debug)]
pub struct LocalFileHandle {
    /// File handler.
    file: File,

    /// File path, for diagnostics.
    path: String,

    /// Known size of the file. This is either passed in on construction or
    /// cached on the first metadata call.
    size: OnceLock<u64>,
}

impl LocalFileHandle {
    /// Open a local file for positional reads.
    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, known_size: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::IO {
                source: format!("{} was not found", path.display()).into(),
                location: location!(),
            },
            _ => e.into(),
        })?;
        let size = OnceLock::new();
        if let Some(known_size) = known_size {
            let _ = size.set(known_size);
        }
        Ok(Self {
            file,
            path: path.display().to_string(),
            size,
        })
    }
}

impl FileHandle for LocalFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    /// Returns the file size.
    fn size(&self) -> Result<u64> {
        if let Some(size) = self.size.get() {
            return Ok(*size);
        }
        let size = self.file.metadata()?.len();
        Ok(*self.size.get_or_init(|| size))
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let length = buf.len() as u64;
        #[cfg(unix)]
        let res = self.file.read_exact_at(buf, offset);
        #[cfg(windows)]
        let res = read_exact_at(&self.file, buf, offset);

        res.map_err(|err| {
            Error::read_failed(
                &self.path,
                offset,
                length,
                Error::IO {
                    source: box_error(err),
                    location: location!(),
                },
            )
        })
    }
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    let expected_len = buf.len();
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => break,
            Ok(n) => {
                let tmp = buf;
                buf = &mut tmp[n..];
                offset += n as u64;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    if !buf.is_empty() {
        Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "failed to fill whole buffer. Expected {} bytes, got {}",
                expected_len,
                expected_len - buf.len()
            ),
        ))
    } else {
        Ok(())
    }
}
