//! VFS operations trait.
//!
//! The protocol surface shared by the FUSE and SFTP bindings: path-based,
//! explicit offset/size. Every mutating call is part of the vocabulary so
//! bindings can wire it, but read-only implementations reject it.

use async_trait::async_trait;
use std::path::PathBuf;

use super::VfsResult;
use super::translator::OpenFile;
use super::types::{DirListing, FileAttr, OpenFlags, SetAttr, StatFs};

/// Core VFS operations trait.
///
/// Paths are absolute client paths (`/search/...`). The FUSE binding maps
/// inodes to paths locally.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes.
    async fn getattr(&self, path: &str) -> VfsResult<FileAttr>;

    /// Read directory entries, `.` and `..` first.
    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirListing>>;

    /// Open a file for reading. Any write flag is rejected.
    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<OpenFile>;

    /// Read up to `size` bytes at `offset` from an open file.
    ///
    /// Returns fewer bytes at EOF, and an empty buffer past it.
    async fn read(&self, file: &OpenFile, offset: u64, size: u32) -> VfsResult<Vec<u8>>;

    /// Canonical form of a client path.
    async fn realpath(&self, path: &str) -> VfsResult<String>;

    /// Read symbolic link target.
    async fn readlink(&self, path: &str) -> VfsResult<PathBuf>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write data to a file.
    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> VfsResult<u32>;

    /// Create a new file.
    async fn create(&self, path: &str, mode: u32) -> VfsResult<FileAttr>;

    /// Create a new directory.
    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<FileAttr>;

    /// Remove a file.
    async fn unlink(&self, path: &str) -> VfsResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &str) -> VfsResult<()>;

    /// Rename a file or directory.
    async fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    /// Truncate a file to the specified size.
    async fn truncate(&self, path: &str, size: u64) -> VfsResult<()>;

    /// Set file attributes (chmod, chown, utimens).
    async fn setattr(&self, path: &str, attr: SetAttr) -> VfsResult<FileAttr>;

    /// Create a symbolic link at `path` pointing to `target`.
    async fn symlink(&self, path: &str, target: &str) -> VfsResult<FileAttr>;

    /// Create a hard link at `newpath` pointing to `oldpath`.
    async fn link(&self, oldpath: &str, newpath: &str) -> VfsResult<FileAttr>;

    /// Set an extended attribute.
    async fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> VfsResult<()>;

    /// Remove an extended attribute.
    async fn removexattr(&self, path: &str, name: &str) -> VfsResult<()>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Returns true if this filesystem is read-only.
    fn read_only(&self) -> bool;

    /// Get filesystem statistics.
    async fn statfs(&self) -> VfsResult<StatFs>;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    async fn exists(&self, path: &str) -> bool {
        self.getattr(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &str) -> VfsResult<Vec<u8>> {
        let file = self.open(path, OpenFlags::read()).await?;
        let size = u32::try_from(file.attr().size).unwrap_or(u32::MAX);
        self.read(&file, 0, size).await
    }
}
