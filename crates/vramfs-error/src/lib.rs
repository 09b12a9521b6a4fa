#![forbid(unsafe_code)]
//! Error types for vramfs.
//!
//! Defines `VramError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all vramfs engine operations.
#[derive(Debug, Error)]
pub enum VramError {
    #[error("not found")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("entry exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("out of video memory")]
    OutOfVram,

    #[error("bad file handle")]
    BadHandle,

    #[error("device error: {0}")]
    Device(String),
}

impl VramError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NotPermitted => libc::EPERM,
            Self::OutOfVram => libc::ENOSPC,
            Self::BadHandle => libc::EBADF,
            Self::Device(_) => libc::EIO,
        }
    }
}

/// Result alias using `VramError`.
pub type Result<T> = std::result::Result<T, VramError>;
