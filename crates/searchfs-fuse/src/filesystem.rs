//! `fuser` binding of a [`PathTranslator`].
//!
//! FUSE callbacks are synchronous; every translator future is driven with
//! `block_on` on the runtime handle the filesystem was created with. The
//! callbacks themselves run on the FUSE session thread, never inside the
//! runtime.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use searchfs_kernel::vfs::{
    DIR_PERM, DirListing, FileAttr, OpenFile, OpenFlags, SetAttr, VfsError, VfsOps, VfsResult,
};
use searchfs_kernel::PathTranslator;
use tokio::runtime::Handle;

use crate::inodes::{InodeTable, ROOT_INO, STATUS_INO, UPDATE_INO, child_path};

/// Attribute/entry cache lifetime handed to the kernel.
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

/// Convert a VFS attribute into the kernel's form.
pub fn to_fuse_attr(ino: u64, attr: &FileAttr) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: if attr.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm: (attr.perm & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Read-only filesystem over one user's searches.
pub struct SearchFs {
    translator: Arc<PathTranslator>,
    runtime: Handle,
    inodes: InodeTable,
    files: HashMap<u64, OpenFile>,
    dirs: HashMap<u64, Vec<DirListing>>,
    next_fh: u64,
    started: SystemTime,
}

impl SearchFs {
    pub fn new(translator: Arc<PathTranslator>, runtime: Handle) -> Self {
        Self {
            translator,
            runtime,
            inodes: InodeTable::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_fh: 0,
            started: SystemTime::now(),
        }
    }

    pub fn translator(&self) -> &Arc<PathTranslator> {
        &self.translator
    }

    fn next_handle(&mut self) -> u64 {
        self.next_fh += 1;
        self.next_fh
    }

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path(ino).map(str::to_owned).ok_or(libc::ENOENT)
    }

    /// Fixed directory stat answered by the pseudo-entries.
    fn pseudo_attr(&self, ino: u64) -> fuser::FileAttr {
        let identity = &self.translator.options().identity;
        let attr = FileAttr::directory(DIR_PERM, 0, identity.uid, identity.gid, self.started);
        to_fuse_attr(ino, &attr)
    }

    fn stat_pseudo(&self, ino: u64) -> Option<fuser::FileAttr> {
        match ino {
            STATUS_INO => Some(self.pseudo_attr(ino)),
            UPDATE_INO => {
                if let Err(e) = self.runtime.block_on(self.translator.refresh()) {
                    tracing::warn!(error = %e, "forced rebuild failed");
                }
                Some(self.pseudo_attr(ino))
            }
            _ => None,
        }
    }

    /// Attributes of an inode.
    pub fn attr_of(&mut self, ino: u64) -> Result<fuser::FileAttr, i32> {
        if let Some(attr) = self.stat_pseudo(ino) {
            return Ok(attr);
        }
        let path = self.path_of(ino)?;
        let attr = self
            .runtime
            .block_on(self.translator.stat(&path))
            .map_err(|e| errno(&path, e))?;
        Ok(to_fuse_attr(ino, &attr))
    }

    /// Attributes of `name` inside directory `parent`.
    ///
    /// Only names that stat successfully get an inode.
    pub fn lookup_child(&mut self, parent: u64, name: &OsStr) -> Result<fuser::FileAttr, i32> {
        let name = name.to_str().ok_or(libc::ENOENT)?;
        let path = child_path(&self.path_of(parent)?, name);
        if let Some(ino @ (STATUS_INO | UPDATE_INO)) = self.inodes.get(&path) {
            return self.attr_of(ino);
        }
        let attr = self
            .runtime
            .block_on(self.translator.stat(&path))
            .map_err(|e| errno(&path, e))?;
        Ok(to_fuse_attr(self.inodes.intern(&path), &attr))
    }

    /// Number of inodes handed out so far.
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Snapshot a directory listing under a new handle.
    pub fn open_dir(&mut self, ino: u64) -> Result<u64, i32> {
        let path = self.path_of(ino)?;
        let listing = self
            .runtime
            .block_on(self.translator.list_directory(&path))
            .map_err(|e| errno(&path, e))?;
        let fh = self.next_handle();
        self.dirs.insert(fh, listing);
        Ok(fh)
    }

    /// Entries of an open directory from `offset` on: `(ino, next offset,
    /// kind, name)`.
    pub fn dir_entries(
        &mut self,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> Result<Vec<(u64, i64, FileType, String)>, i32> {
        let path = self.path_of(ino)?;
        let listing = self.dirs.get(&fh).ok_or(libc::EBADF)?;
        let mut out = Vec::new();
        for (i, entry) in listing.iter().enumerate().skip(offset.max(0) as usize) {
            let entry_ino = match entry.name.as_str() {
                "." => ino,
                ".." => self.inodes.parent(&path),
                name => self.inodes.intern(&child_path(&path, name)),
            };
            let kind = if entry.attr.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            out.push((entry_ino, (i + 1) as i64, kind, entry.name.clone()));
        }
        Ok(out)
    }

    /// Open a leaf; any write access is refused.
    pub fn open_file(&mut self, ino: u64, flags: i32) -> Result<u64, i32> {
        if matches!(ino, ROOT_INO | STATUS_INO | UPDATE_INO) {
            return Err(libc::EISDIR);
        }
        let path = self.path_of(ino)?;
        let file = self
            .runtime
            .block_on(self.translator.open_file(&path, OpenFlags::from_posix(flags)))
            .map_err(|e| errno(&path, e))?;
        let fh = self.next_handle();
        self.files.insert(fh, file);
        Ok(fh)
    }

    pub fn read_file(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let file = self.files.get(&fh).ok_or(libc::EBADF)?;
        let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;
        self.runtime
            .block_on(file.read_at(offset, size))
            .map_err(|e| e.errno())
    }

    pub fn open_handles(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    /// Route a mutating call through the translator so it is logged, then
    /// report its errno.
    fn rejected<T>(&self, op: &str, result: VfsResult<T>) -> i32 {
        match result {
            Err(e) => {
                tracing::debug!(op, error = %e, "fuse request refused");
                e.errno()
            }
            Ok(_) => libc::EROFS,
        }
    }

    fn path_or_root(&self, ino: u64) -> String {
        self.inodes.path(ino).unwrap_or("/").to_owned()
    }

    fn entry_path(&self, parent: u64, name: &OsStr) -> String {
        child_path(&self.path_or_root(parent), &name.to_string_lossy())
    }
}

fn errno(path: &str, error: VfsError) -> i32 {
    if !matches!(error, VfsError::NotFound(_)) {
        tracing::debug!(path, error = %error, "fuse request failed");
    }
    error.errno()
}

impl Filesystem for SearchFs {
    fn destroy(&mut self) {
        tracing::info!(login = %self.translator.options().login, "filesystem unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_child(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr_of(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = self.path_or_root(ino);
        let request = SetAttr {
            size,
            perm: mode,
            uid,
            gid,
            ..SetAttr::new()
        };
        let result = self.runtime.block_on(self.translator.setattr(&path, request));
        reply.error(self.rejected("setattr", result));
    }

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyData) {
        reply.error(libc::EINVAL);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = self.entry_path(parent, name);
        let result = self.runtime.block_on(self.translator.create(&path, mode));
        reply.error(self.rejected("mknod", result));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = self.entry_path(parent, name);
        let result = self.runtime.block_on(self.translator.mkdir(&path, mode));
        reply.error(self.rejected("mkdir", result));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.entry_path(parent, name);
        let result = self.runtime.block_on(self.translator.unlink(&path));
        reply.error(self.rejected("unlink", result));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.entry_path(parent, name);
        let result = self.runtime.block_on(self.translator.rmdir(&path));
        reply.error(self.rejected("rmdir", result));
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = self.entry_path(parent, link_name);
        let target = target.to_string_lossy();
        let result = self.runtime.block_on(self.translator.symlink(&path, &target));
        reply.error(self.rejected("symlink", result));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = self.entry_path(parent, name);
        let to = self.entry_path(newparent, newname);
        let result = self.runtime.block_on(self.translator.rename(&from, &to));
        reply.error(self.rejected("rename", result));
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let from = self.path_or_root(ino);
        let to = self.entry_path(newparent, newname);
        let result = self.runtime.block_on(self.translator.link(&from, &to));
        reply.error(self.rejected("link", result));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_file(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_file(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = self.path_or_root(ino);
        let offset = offset.max(0) as u64;
        let result = self.runtime.block_on(self.translator.write(&path, offset, data));
        reply.error(self.rejected("write", result));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.files.remove(&fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_dir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.dir_entries(ino, fh, offset) {
            Ok(entries) => {
                for (entry_ino, next, kind, name) in entries {
                    if reply.add(entry_ino, next, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.dirs.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.runtime.block_on(self.translator.statfs()) {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = self.path_or_root(ino);
        let name = name.to_string_lossy();
        let result = self.runtime.block_on(self.translator.setxattr(&path, &name, value));
        reply.error(self.rejected("setxattr", result));
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.path_or_root(ino);
        let name = name.to_string_lossy();
        let result = self.runtime.block_on(self.translator.removexattr(&path, &name));
        reply.error(self.rejected("removexattr", result));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = self.entry_path(parent, name);
        let result = self.runtime.block_on(self.translator.create(&path, mode));
        reply.error(self.rejected("create", result));
    }
}
