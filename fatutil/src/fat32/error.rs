//! Volume engine error types.

use std::io;
use thiserror::Error;

/// Errors reported by the FAT32 volume engine.
#[derive(Debug, Error)]
pub enum FatError {
    /// The backing image could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Sector 0 does not describe a FAT32 volume.
    #[error("not a FAT32 volume: {0}")]
    NotFat32(&'static str),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry with the same name already exists in the parent.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a regular file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory still has entries besides `.` and `..`.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Name does not fit the 8.3 short-name rules.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// No free cluster left on the volume.
    #[error("no space left on volume")]
    NoSpace,

    /// The volume was mounted without write access.
    #[error("volume is read-only")]
    ReadOnly,

    /// The node was opened read-only.
    #[error("node is not open for writing: {0}")]
    NotWritable(String),

    /// The root directory cannot be created, removed or renamed.
    #[error("operation not permitted on the root directory")]
    RootDirectory,

    /// FAT32 file sizes are limited to 4 GiB - 1.
    #[error("file too large")]
    FileTooLarge,

    /// A cluster chain links outside the data area or into a free cluster.
    #[error("corrupt cluster chain at cluster {0}")]
    BadCluster(u32),
}

impl FatError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName(name.into())
    }

    /// True when the error only says the path does not resolve.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Volume engine result type.
pub type FatResult<T> = Result<T, FatError>;
