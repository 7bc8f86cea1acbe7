#![forbid(unsafe_code)]
//! Error types for PBFS.
//!
//! Defines `PbfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the POSIX-shaped facade.

use pbfs_types::{Interrupted, ParseError};
use thiserror::Error;

/// Unified error type for all PBFS operations.
#[derive(Debug, Error)]
pub enum PbfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at device offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("bad file descriptor")]
    BadFd,

    #[error("version skew, caller should retry")]
    Again,

    #[error("no space left on device")]
    NoSpace,

    #[error("file too large")]
    FileTooBig,

    #[error("too many open files")]
    TooManyFiles,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("read-only mount")]
    ReadOnly,

    #[error("resource busy")]
    Busy,

    #[error("fenced: {0}")]
    Fenced(String),

    #[error("cross-device operation")]
    CrossDevice,

    #[error("stale mount epoch")]
    Stale,

    #[error("operation timed out")]
    TimedOut,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation not supported")]
    NotSupported,
}

impl PbfsError {
    /// Convert this error into a POSIX errno for the facade.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Invalid(_) => libc::EINVAL,
            Self::BadFd => libc::EBADF,
            Self::Again => libc::EAGAIN,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooBig => libc::EFBIG,
            Self::TooManyFiles => libc::EMFILE,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
            Self::Busy => libc::EBUSY,
            Self::Fenced(_) => libc::EACCES,
            Self::CrossDevice => libc::EXDEV,
            Self::Stale => libc::ESTALE,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::Cancelled => libc::ECANCELED,
            Self::NotSupported => libc::ENOTSUP,
        }
    }
}

impl From<ParseError> for PbfsError {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

impl From<Interrupted> for PbfsError {
    fn from(err: Interrupted) -> Self {
        match err {
            Interrupted::Aborted => Self::Cancelled,
            Interrupted::DeadlineExceeded => Self::TimedOut,
        }
    }
}

/// Result alias using `PbfsError`.
pub type Result<T> = std::result::Result<T, PbfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_taxonomy() {
        assert_eq!(PbfsError::Again.to_errno(), libc::EAGAIN);
        assert_eq!(PbfsError::Stale.to_errno(), libc::ESTALE);
        assert_eq!(PbfsError::TimedOut.to_errno(), libc::ETIMEDOUT);
        assert_eq!(PbfsError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(PbfsError::Fenced("lease".into()).to_errno(), libc::EACCES);
        assert_eq!(PbfsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(PbfsError::NotSupported.to_errno(), libc::ENOTSUP);
    }

    #[test]
    fn interrupted_maps_to_cancel_and_timeout() {
        assert!(matches!(
            PbfsError::from(Interrupted::Aborted),
            PbfsError::Cancelled
        ));
        assert!(matches!(
            PbfsError::from(Interrupted::DeadlineExceeded),
            PbfsError::TimedOut
        ));
    }
}
