#![forbid(unsafe_code)]
//! Error types for SlateFS.
//!
//! Defines `FsError` and a `Result<T>` alias used throughout the workspace.
//! Recoverable conditions are error variants; invariant violations (bitmap
//! double-free, unlocking an unlocked inode, truncation residue) panic at
//! the point of detection.

use thiserror::Error;

/// Unified error type for all SlateFS operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The in-memory free-block view is exhausted. Recoverable in `writei`
    /// (short write); a program invariant violation on read paths.
    #[error("out of blocks")]
    OutOfBlocks,

    /// `ialloc` scanned the whole inum space without finding a free slot.
    #[error("out of inodes")]
    OutOfInodes,

    /// A cache lookup raced with inode victimization; the enclosing
    /// operation must be restarted from the top.
    #[error("lookup raced with eviction, retry")]
    Retry,

    #[error("not a directory")]
    NotADirectory,

    #[error("path component longer than {limit} bytes")]
    BadPath { limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("entry exists")]
    Exists,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },
}

impl FsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfBlocks | Self::OutOfInodes => libc::ENOSPC,
            Self::Retry => libc::EAGAIN,
            Self::NotADirectory => libc::ENOTDIR,
            Self::BadPath { .. } => libc::ENAMETOOLONG,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::Corruption { .. } => libc::EIO,
        }
    }

    /// Whether the enclosing operation should be restarted from scratch.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;
