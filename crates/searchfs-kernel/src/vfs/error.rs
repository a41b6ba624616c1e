//! VFS error types.

use std::io;
use thiserror::Error;

/// VFS error type.
///
/// Covers both per-request failures (surfaced to protocol clients) and
/// tree-construction failures (which abort a rebuild).
#[derive(Debug, Error)]
pub enum VfsError {
    /// Unknown path or search.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Filesystem is read-only.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Operation is not part of the supported vocabulary.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// The framing unix user may not read this path.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Same path inserted twice with different attributes.
    #[error("conflicting entry: {0}")]
    ConflictingEntry(String),

    /// Inserted a child before its parent directory.
    #[error("missing parent directory for: {0}")]
    MissingParent(String),

    /// The backing store could not answer. Transient.
    #[error("backing store unavailable: {0}")]
    BackingUnavailable(String),

    /// Rejected search definition.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// No tree has been built yet for this session.
    #[error("session not ready")]
    NotReady,

    /// The session was closed.
    #[error("session closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a NotSupported error.
    pub fn not_supported(op: impl Into<String>) -> Self {
        Self::NotSupported(op.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a ConflictingEntry error.
    pub fn conflicting_entry(path: impl Into<String>) -> Self {
        Self::ConflictingEntry(path.into())
    }

    /// Create a MissingParent error.
    pub fn missing_parent(path: impl Into<String>) -> Self {
        Self::MissingParent(path.into())
    }

    /// Create a BackingUnavailable error.
    pub fn backing_unavailable(msg: impl Into<String>) -> Self {
        Self::BackingUnavailable(msg.into())
    }

    /// Create a Validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True for errors raised while constructing a tree.
    ///
    /// These abort the current rebuild; the previous tree keeps serving.
    pub fn is_construction_error(&self) -> bool {
        matches!(self, Self::ConflictingEntry(_) | Self::MissingParent(_))
    }

    /// True when the caller should retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackingUnavailable(_) | Self::NotReady)
    }

    /// Native errno for the FUSE binding.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::ReadOnly => libc::EROFS,
            Self::NotSupported(_) => libc::ENOTSUP,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::InvalidPath(_) => libc::EINVAL,
            Self::BackingUnavailable(_) | Self::NotReady => libc::EAGAIN,
            Self::Closed => libc::ESHUTDOWN,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::ConflictingEntry(_)
            | Self::MissingParent(_)
            | Self::Validation(_)
            | Self::Other(_) => libc::EIO,
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::ReadOnly => {
                io::Error::new(io::ErrorKind::ReadOnlyFilesystem, "filesystem is read-only")
            }
            VfsError::NotSupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::BackingUnavailable(msg) => io::Error::other(msg),
            VfsError::NotReady => io::Error::new(io::ErrorKind::WouldBlock, "session not ready"),
            VfsError::Closed => io::Error::new(io::ErrorKind::NotConnected, "session closed"),
            VfsError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
