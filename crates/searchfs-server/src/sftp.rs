//! SFTP subsystem over a session's [`PathTranslator`].
//!
//! Handles are opaque counters. A directory handle snapshots the listing at
//! `opendir` and hands it out in one `readdir` reply, then `EOF`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags as SftpOpenFlags, Status,
    StatusCode, Version,
};
use searchfs_kernel::vfs::{DirListing, FileAttr, OpenFile, OpenFlags, SetAttr, VfsError, VfsOps};
use searchfs_kernel::PathTranslator;

/// Map a VFS error onto an SFTP status.
pub fn status_of(error: &VfsError) -> StatusCode {
    match error {
        VfsError::NotFound(_) | VfsError::InvalidPath(_) => StatusCode::NoSuchFile,
        VfsError::ReadOnly | VfsError::PermissionDenied(_) => StatusCode::PermissionDenied,
        VfsError::NotSupported(_) => StatusCode::OpUnsupported,
        VfsError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        VfsError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            StatusCode::PermissionDenied
        }
        _ => StatusCode::Failure,
    }
}

fn epoch_secs(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// SFTP attributes of a VFS entry.
pub fn file_attributes(attr: &FileAttr) -> FileAttributes {
    FileAttributes {
        size: Some(attr.size),
        uid: Some(attr.uid),
        gid: Some(attr.gid),
        permissions: Some(attr.mode()),
        atime: Some(epoch_secs(attr.atime)),
        mtime: Some(epoch_secs(attr.mtime)),
        ..Default::default()
    }
}

fn open_flags(pflags: SftpOpenFlags) -> OpenFlags {
    OpenFlags {
        read: pflags.contains(SftpOpenFlags::READ),
        write: pflags.contains(SftpOpenFlags::WRITE),
        append: pflags.contains(SftpOpenFlags::APPEND),
        create: pflags.contains(SftpOpenFlags::CREATE),
        truncate: pflags.contains(SftpOpenFlags::TRUNCATE),
        exclusive: pflags.contains(SftpOpenFlags::EXCLUDE),
    }
}

enum HandleState {
    File(OpenFile),
    Dir { entries: Vec<DirListing>, sent: bool },
}

/// One client's SFTP session.
pub struct SftpSession {
    translator: Arc<PathTranslator>,
    handles: HashMap<String, HandleState>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(translator: Arc<PathTranslator>) -> Self {
        Self {
            translator,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn insert(&mut self, state: HandleState) -> String {
        self.next_handle += 1;
        let handle = self.next_handle.to_string();
        self.handles.insert(handle.clone(), state);
        handle
    }

    fn ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    fn failed(&self, op: &str, path: &str, error: VfsError) -> StatusCode {
        let status = status_of(&error);
        tracing::debug!(
            login = %self.translator.options().login,
            op,
            path,
            error = %error,
            "sftp request failed"
        );
        status
    }

    async fn attrs(&self, id: u32, path: String) -> Result<Attrs, StatusCode> {
        match self.translator.getattr(&path).await {
            Ok(attr) => Ok(Attrs {
                id,
                attrs: file_attributes(&attr),
            }),
            Err(e) => Err(self.failed("stat", &path, e)),
        }
    }

    fn rejected(
        &self,
        result: searchfs_kernel::VfsResult<()>,
        op: &str,
        path: &str,
    ) -> Result<Status, StatusCode> {
        match result {
            Ok(()) => Err(StatusCode::Failure),
            Err(e) => Err(self.failed(op, path, e)),
        }
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        tracing::debug!(login = %self.translator.options().login, version, "sftp init");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: SftpOpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        match self.translator.open(&filename, open_flags(pflags)).await {
            Ok(file) => Ok(Handle {
                id,
                handle: self.insert(HandleState::File(file)),
            }),
            Err(e) => Err(self.failed("open", &filename, e)),
        }
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(_) => Ok(Self::ok(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let Some(HandleState::File(file)) = self.handles.get(&handle) else {
            return Err(StatusCode::Failure);
        };
        match self.translator.read(file, offset, len).await {
            Ok(data) if data.is_empty() => Err(StatusCode::Eof),
            Ok(data) => Ok(Data { id, data }),
            Err(e) => Err(self.failed("read", &handle, e)),
        }
    }

    async fn write(
        &mut self,
        _id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let result = self.translator.write(&handle, offset, &data).await.map(|_| ());
        self.rejected(result, "write", &handle)
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.attrs(id, path).await
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.attrs(id, path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        match self.handles.get(&handle) {
            Some(HandleState::File(file)) => Ok(Attrs {
                id,
                attrs: file_attributes(file.attr()),
            }),
            Some(HandleState::Dir { entries, .. }) => entries
                .first()
                .map(|dot| Attrs {
                    id,
                    attrs: file_attributes(&dot.attr),
                })
                .ok_or(StatusCode::Failure),
            None => Err(StatusCode::Failure),
        }
    }

    async fn setstat(
        &mut self,
        _id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let result = self.translator.setattr(&path, SetAttr::new()).await.map(|_| ());
        self.rejected(result, "setstat", &path)
    }

    async fn fsetstat(
        &mut self,
        _id: u32,
        handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let result = self.translator.setattr(&handle, SetAttr::new()).await.map(|_| ());
        self.rejected(result, "fsetstat", &handle)
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        match self.translator.readdir(&path).await {
            Ok(entries) => Ok(Handle {
                id,
                handle: self.insert(HandleState::Dir {
                    entries,
                    sent: false,
                }),
            }),
            Err(e) => Err(self.failed("opendir", &path, e)),
        }
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(HandleState::Dir { entries, sent }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        if *sent {
            return Err(StatusCode::Eof);
        }
        *sent = true;
        let files = entries
            .iter()
            .map(|entry| File {
                filename: entry.name.clone(),
                longname: entry.long_name.clone(),
                attrs: file_attributes(&entry.attr),
            })
            .collect();
        Ok(Name { id, files })
    }

    async fn remove(&mut self, _id: u32, filename: String) -> Result<Status, Self::Error> {
        let result = self.translator.unlink(&filename).await;
        self.rejected(result, "remove", &filename)
    }

    async fn mkdir(
        &mut self,
        _id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let result = self.translator.mkdir(&path, 0o755).await.map(|_| ());
        self.rejected(result, "mkdir", &path)
    }

    async fn rmdir(&mut self, _id: u32, path: String) -> Result<Status, Self::Error> {
        let result = self.translator.rmdir(&path).await;
        self.rejected(result, "rmdir", &path)
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        match self.translator.realpath(&path).await {
            Ok(canonical) => Ok(Name {
                id,
                files: vec![File {
                    filename: canonical.clone(),
                    longname: canonical,
                    attrs: FileAttributes::default(),
                }],
            }),
            Err(e) => Err(self.failed("realpath", &path, e)),
        }
    }

    async fn rename(
        &mut self,
        _id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let result = self.translator.rename(&oldpath, &newpath).await;
        self.rejected(result, "rename", &oldpath)
    }

    async fn readlink(&mut self, _id: u32, path: String) -> Result<Name, Self::Error> {
        match self.translator.readlink(&path).await {
            Ok(_) => Err(StatusCode::OpUnsupported),
            Err(e) => Err(self.failed("readlink", &path, e)),
        }
    }

    async fn symlink(
        &mut self,
        _id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        let result = self.translator.symlink(&linkpath, &targetpath).await.map(|_| ());
        self.rejected(result, "symlink", &linkpath)
    }
}
