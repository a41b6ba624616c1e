//! Core VFS types.
//!
//! Attribute and listing types shared by the FUSE and SFTP bindings.
//! Both protocols marshal from these; neither sees a raw `stat` tuple.

use std::time::SystemTime;

/// `S_IFREG` type bits.
pub const MODE_REGULAR: u32 = 0o100000;
/// `S_IFDIR` type bits.
pub const MODE_DIRECTORY: u32 = 0o040000;

/// Permissions of the synthetic root (read + execute for everyone).
pub const ROOT_DIR_PERM: u32 = 0o555;
/// Permissions of every other virtual directory (owner read + execute).
pub const DIR_PERM: u32 = 0o500;
/// Permissions reported for blob leaves.
pub const BLOB_FILE_PERM: u32 = 0o444;
/// Size reported for virtual directories.
pub const DIR_SIZE: u64 = 4096;

/// Liveness probe answered at the root of a FUSE mount.
pub const STATUS_ENTRY: &str = ".status";
/// Stat'ing this root entry of a FUSE mount forces a rebuild.
pub const UPDATE_ENTRY: &str = ".update";

/// Kind of a namespace entry. Symlinks are never surfaced: a real file
/// is reported as regular.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        *self == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        *self == FileType::Directory
    }

    /// `S_IFMT` bits.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => MODE_REGULAR,
            FileType::Directory => MODE_DIRECTORY,
        }
    }
}

/// What `stat` reports for an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub size: u64,
    pub kind: FileType,
    /// Permission bits, without type bits.
    pub perm: u32,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileAttr {
    /// Attributes of a virtual directory.
    ///
    /// `nlink` is children + 2 (self and parent reference).
    pub fn directory(perm: u32, children: usize, uid: u32, gid: u32, created_at: SystemTime) -> Self {
        Self {
            size: DIR_SIZE,
            kind: FileType::Directory,
            perm,
            mtime: created_at,
            atime: created_at,
            ctime: created_at,
            nlink: children as u32 + 2,
            uid,
            gid,
        }
    }

    /// Attributes of a blob leaf whose payload length is `size`.
    pub fn blob(size: u64, uid: u32, gid: u32) -> Self {
        Self {
            size,
            kind: FileType::File,
            perm: BLOB_FILE_PERM,
            mtime: SystemTime::UNIX_EPOCH,
            atime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            nlink: 1,
            uid,
            gid,
        }
    }

    /// Full POSIX mode (type bits | permission bits).
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | (self.perm & 0o7777)
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Any write bit set.
    pub fn is_writable(&self) -> bool {
        self.perm & 0o222 != 0
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DirListing {
    pub name: String,
    /// The row as `ls -l` prints it.
    pub long_name: String,
    pub attr: FileAttr,
}

/// Attribute changes a client requested. Never applied.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `statfs` answer. A read-only namespace has no free space.
#[derive(Debug, Clone)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    /// Entries in the namespace.
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl StatFs {
    pub fn read_only(files: u64) -> Self {
        Self {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        }
    }
}

/// Access a client asked for when opening a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    /// `O_EXCL`
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Decode POSIX `open(2)` flags.
    pub fn from_posix(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
            exclusive: flags & libc::O_EXCL != 0,
        }
    }

    /// True if any flag implies modifying the file.
    pub fn wants_write(&self) -> bool {
        self.write || self.append || self.create || self.truncate || self.exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type() {
        assert!(FileType::File.is_file());
        assert!(!FileType::File.is_dir());
        assert!(FileType::Directory.is_dir());
    }

    #[test]
    fn test_directory_attr() {
        let dir = FileAttr::directory(DIR_PERM, 3, 1000, 1000, SystemTime::UNIX_EPOCH);
        assert!(dir.is_dir());
        assert_eq!(dir.size, DIR_SIZE);
        assert_eq!(dir.nlink, 5);
        assert_eq!(dir.mode(), 0o040500);
        assert!(!dir.is_writable());
    }

    #[test]
    fn test_blob_attr() {
        let blob = FileAttr::blob(16, 0, 0);
        assert!(blob.is_file());
        assert_eq!(blob.mode(), 0o100444);
        assert_eq!(blob.size, 16);
    }

    #[test]
    fn test_open_flags() {
        let read = OpenFlags::read();
        assert!(read.read);
        assert!(!read.wants_write());

        assert!(OpenFlags::write().wants_write());
        assert!(OpenFlags::from_posix(libc::O_RDWR).wants_write());
        assert!(OpenFlags::from_posix(libc::O_WRONLY | libc::O_CREAT).create);
        assert!(!OpenFlags::from_posix(libc::O_RDONLY).wants_write());
        assert!(OpenFlags::from_posix(libc::O_RDONLY | libc::O_TRUNC).wants_write());
    }
}
