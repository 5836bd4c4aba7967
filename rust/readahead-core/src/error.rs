// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use snafu::{Location, Snafu};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Allocates error on the heap and then places `e` into it.
#[inline]
pub fn box_error(e: impl std::error::Error + Send + Sync + 'static) -> BoxedError {
    Box::new(e)
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid user input: {source}, {location}"))]
    InvalidInput {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("ReadaheadError(IO): {source}, {location}"))]
    IO {
        source: BoxedError,
        location: Location,
    },
    /// A read against the file handle failed for a specific span.
    #[snafu(display(
        "Failed to read {length} bytes at offset {offset} from {path}: {source}, {location}"
    ))]
    ReadFailed {
        path: String,
        offset: u64,
        length: u64,
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Unable to allocate a buffer of {size} bytes: {message}, {location}"))]
    ResourceExhausted {
        size: usize,
        message: String,
        location: Location,
    },
    #[snafu(display("Encountered internal error: {message}, {location}"))]
    Internal { message: String, location: Location },
}

impl Error {
    /// Wrap `source` as the failure of reading `length` bytes at `offset`.
    ///
    /// An error that is already a [`Error::ReadFailed`] is passed through unchanged
    /// so the innermost span is the one reported.
    #[track_caller]
    pub fn read_failed(path: impl Into<String>, offset: u64, length: u64, source: Self) -> Self {
        match source {
            Self::ReadFailed { .. } => source,
            source => Self::ReadFailed {
                path: path.into(),
                offset,
                length,
                source: box_error(source),
                location: caller_location(),
            },
        }
    }

    /// The byte span this error is associated with, if any.
    pub fn span(&self) -> Option<(u64, u64)> {
        match self {
            Self::ReadFailed { offset, length, .. } => Some((*offset, *length)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[track_caller]
fn caller_location() -> Location {
    let location = std::panic::Location::caller();
    Location::new(location.file(), location.line(), location.column())
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::IO {
            source: box_error(e),
            location: caller_location(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    #[track_caller]
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal {
            message: format!("Blocking read task did not complete: {e}"),
            location: caller_location(),
        }
    }
}

impl Error {
    fn io_kind(&self) -> std::io::ErrorKind {
        match self {
            Self::ResourceExhausted { .. } => std::io::ErrorKind::OutOfMemory,
            Self::InvalidInput { .. } => std::io::ErrorKind::InvalidInput,
            Self::IO { source, .. } | Self::ReadFailed { source, .. } => {
                if let Some(e) = source.downcast_ref::<std::io::Error>() {
                    e.kind()
                } else if let Some(e) = source.downcast_ref::<Self>() {
                    e.io_kind()
                } else {
                    std::io::ErrorKind::Other
                }
            }
            Self::Internal { .. } => std::io::ErrorKind::Other,
        }
    }
}

// Consumers of `std::io::Read` only understand `std::io::Error`, so the cursor
// needs to be able to hand errors back in that shape.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        Self::new(err.io_kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use snafu::location;

    use super::*;

    #[test]
    fn test_io_error_captures_caller() {
        let line = line!() + 1;
        let err: Error = std::io::Error::new(ErrorKind::UnexpectedEof, "short read").into();
        match err {
            Error::IO { location, .. } => {
                assert_eq!(location.line, line);
                assert!(location.file.ends_with("error.rs"));
            }
            _ => panic!("expected IO error, got {err:?}"),
        }
    }

    #[test]
    fn test_read_failed_keeps_innermost_span() {
        let io_err: Error = std::io::Error::new(ErrorKind::UnexpectedEof, "short read").into();
        let inner = Error::read_failed("data.bin", 100, 50, io_err);
        assert_eq!(inner.span(), Some((100, 50)));

        let outer = Error::read_failed("data.bin", 0, 500, inner);
        assert_eq!(outer.span(), Some((100, 50)));
        assert!(outer.to_string().contains("50 bytes at offset 100"));
    }

    #[test]
    fn test_into_std_io_error_keeps_kind() {
        let io_err: Error = std::io::Error::new(ErrorKind::UnexpectedEof, "short read").into();
        let err = Error::read_failed("data.bin", 8, 16, io_err);
        let std_err: std::io::Error = err.into();
        assert_eq!(std_err.kind(), ErrorKind::UnexpectedEof);

        let err = Error::ResourceExhausted {
            size: 1 << 40,
            message: "over limit".to_string(),
            location: location!(),
        };
        let std_err: std::io::Error = err.into();
        assert_eq!(std_err.kind(), ErrorKind::OutOfMemory);
    }
}
