//! In-memory virtual directory tree.
//!
//! Maps normalized virtual paths to [`DirectoryEntry`] values. Built root to
//! leaf: a child may only be inserted once its parent directory exists.
//! A tree is never mutated once it is published; refreshes build a new one.

use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::time::SystemTime;

use super::error::{VfsError, VfsResult};
use super::listing::long_line;
use super::path::{basename, parent_of};
use super::types::{DIR_PERM, DirListing, FileAttr, FileType, ROOT_DIR_PERM};
use crate::model::BlobRef;

/// Identifies the bytes behind a blob leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobLocator {
    /// Index of the backing instance within the session.
    pub instance: usize,
    /// Title of the owning search.
    pub search: String,
    /// Which blob.
    pub blob: BlobRef,
}

/// One node of the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEntry {
    /// Leaf backed by a real filesystem path.
    RealFile {
        real_path: String,
        uid: u32,
        gid: u32,
    },
    /// Synthesized directory.
    VirtualDirectory {
        children: IndexSet<String>,
        uid: u32,
        gid: u32,
        mode: u32,
        created_at: SystemTime,
    },
    /// Leaf whose bytes live in the backing store.
    BlobFile {
        locator: BlobLocator,
        uid: u32,
        gid: u32,
    },
}

impl DirectoryEntry {
    /// Returns true for [`DirectoryEntry::VirtualDirectory`].
    pub fn is_dir(&self) -> bool {
        matches!(self, DirectoryEntry::VirtualDirectory { .. })
    }
}

/// Payload sizes of blob leaves, keyed by virtual path.
pub type BlobSizes = HashMap<String, u64>;

/// The namespace served to one protocol session.
#[derive(Debug, Clone)]
pub struct VirtualDirectoryTree {
    entries: IndexMap<String, DirectoryEntry>,
}

impl VirtualDirectoryTree {
    /// A tree holding only the root directory.
    pub fn new(uid: u32, gid: u32, created_at: SystemTime) -> Self {
        let mut entries = IndexMap::new();
        entries.insert(
            "/".to_owned(),
            DirectoryEntry::VirtualDirectory {
                children: IndexSet::new(),
                uid,
                gid,
                mode: ROOT_DIR_PERM,
                created_at,
            },
        );
        Self { entries }
    }

    /// Number of entries, root included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: the root exists from construction.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry.
    pub fn lookup(&self, path: &str) -> Option<&DirectoryEntry> {
        self.entries.get(path)
    }

    /// Every path in insertion order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Insert a virtual directory.
    ///
    /// Re-inserting with identical owner and timestamp is a no-op.
    pub fn make_directory(
        &mut self,
        path: &str,
        uid: u32,
        gid: u32,
        created_at: SystemTime,
    ) -> VfsResult<()> {
        let mode = if path == "/" { ROOT_DIR_PERM } else { DIR_PERM };
        let entry = DirectoryEntry::VirtualDirectory {
            children: IndexSet::new(),
            uid,
            gid,
            mode,
            created_at,
        };
        if let Some(existing) = self.entries.get(path) {
            return match existing {
                DirectoryEntry::VirtualDirectory {
                    uid: u,
                    gid: g,
                    mode: m,
                    created_at: t,
                    ..
                } if (*u, *g, *m, *t) == (uid, gid, mode, created_at) => Ok(()),
                _ => Err(VfsError::conflicting_entry(path)),
            };
        }
        self.insert_child(path, entry)
    }

    /// Insert a leaf backed by `real_path`.
    pub fn add_file(&mut self, path: &str, real_path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        self.insert_leaf(
            path,
            DirectoryEntry::RealFile {
                real_path: real_path.to_owned(),
                uid,
                gid,
            },
        )
    }

    /// Insert a leaf backed by the store.
    pub fn add_blob(&mut self, path: &str, locator: BlobLocator, uid: u32, gid: u32) -> VfsResult<()> {
        self.insert_leaf(path, DirectoryEntry::BlobFile { locator, uid, gid })
    }

    fn insert_leaf(&mut self, path: &str, entry: DirectoryEntry) -> VfsResult<()> {
        if let Some(existing) = self.entries.get(path) {
            return if *existing == entry {
                Ok(())
            } else {
                Err(VfsError::conflicting_entry(path))
            };
        }
        self.insert_child(path, entry)
    }

    fn insert_child(&mut self, path: &str, entry: DirectoryEntry) -> VfsResult<()> {
        let Some(parent) = parent_of(path) else {
            // Root already exists from construction.
            return Err(VfsError::conflicting_entry(path));
        };
        match self.entries.get_mut(parent) {
            Some(DirectoryEntry::VirtualDirectory { children, .. }) => {
                children.insert(basename(path).to_owned());
            }
            Some(_) => return Err(VfsError::not_a_directory(parent)),
            None => return Err(VfsError::missing_parent(path)),
        }
        self.entries.insert(path.to_owned(), entry);
        Ok(())
    }

    /// Attributes of `path`.
    ///
    /// Real files are stat'ed on disk, reported as regular files, and lose
    /// their write bits. Blob sizes are unknown here and reported as 0.
    pub fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let entry = self
            .entries
            .get(path)
            .ok_or_else(|| VfsError::not_found(path))?;
        entry_attr(entry, None)
    }

    /// Attributes of `path`, using a known payload size for blob leaves.
    pub fn stat_sized(&self, path: &str, blob_size: u64) -> VfsResult<FileAttr> {
        let entry = self
            .entries
            .get(path)
            .ok_or_else(|| VfsError::not_found(path))?;
        entry_attr(entry, Some(blob_size))
    }

    /// Lazily list a directory, prefixed by `.` and `..`.
    pub fn list_directory<'a>(
        &'a self,
        path: &str,
        blob_sizes: &'a BlobSizes,
    ) -> VfsResult<impl Iterator<Item = VfsResult<DirListing>> + 'a> {
        let entry = self
            .entries
            .get(path)
            .ok_or_else(|| VfsError::not_found(path))?;
        let DirectoryEntry::VirtualDirectory { children, .. } = entry else {
            return Err(VfsError::not_a_directory(path));
        };

        let own = entry_attr(entry, None)?;
        let parent = match parent_of(path) {
            Some(p) => self.stat(p)?,
            None => own.clone(),
        };
        let prefix = if path == "/" { String::new() } else { path.to_owned() };
        let dots = [(".", own), ("..", parent)]
            .into_iter()
            .map(|(name, attr)| Ok(listing(name, attr)));

        let kids = children.iter().map(move |name| {
            let child = format!("{prefix}/{name}");
            let entry = self
                .entries
                .get(&child)
                .ok_or_else(|| VfsError::not_found(child.as_str()))?;
            let attr = entry_attr(entry, blob_sizes.get(&child).copied())?;
            Ok(listing(name, attr))
        });
        Ok(dots.chain(kids))
    }

    /// Names of a directory's children, without `.` and `..`.
    pub fn children(&self, path: &str) -> VfsResult<Vec<String>> {
        match self.entries.get(path) {
            Some(DirectoryEntry::VirtualDirectory { children, .. }) => {
                Ok(children.iter().cloned().collect())
            }
            Some(_) => Err(VfsError::not_a_directory(path)),
            None => Err(VfsError::not_found(path)),
        }
    }

    /// Blob leaves directly under `path`, keyed by virtual path.
    pub fn blob_children(&self, path: &str) -> VfsResult<Vec<(String, BlobLocator)>> {
        let prefix = if path == "/" { "" } else { path };
        Ok(self
            .children(path)?
            .into_iter()
            .filter_map(|name| {
                let child = format!("{prefix}/{name}");
                match self.entries.get(&child) {
                    Some(DirectoryEntry::BlobFile { locator, .. }) => {
                        Some((child, locator.clone()))
                    }
                    _ => None,
                }
            })
            .collect())
    }

    /// Backing path of a real-file leaf.
    pub fn get_real_path(&self, path: &str) -> VfsResult<&str> {
        match self.entries.get(path) {
            Some(DirectoryEntry::RealFile { real_path, .. }) => Ok(real_path),
            Some(DirectoryEntry::VirtualDirectory { .. }) => Err(VfsError::is_a_directory(path)),
            Some(DirectoryEntry::BlobFile { .. }) => {
                Err(VfsError::other(format!("blob has no real path: {path}")))
            }
            None => Err(VfsError::not_found(path)),
        }
    }
}

fn listing(name: &str, attr: FileAttr) -> DirListing {
    DirListing {
        name: name.to_owned(),
        long_name: long_line(name, &attr),
        attr,
    }
}

fn entry_attr(entry: &DirectoryEntry, blob_size: Option<u64>) -> VfsResult<FileAttr> {
    match entry {
        DirectoryEntry::VirtualDirectory {
            children,
            uid,
            gid,
            mode,
            created_at,
        } => Ok(FileAttr::directory(*mode, children.len(), *uid, *gid, *created_at)),
        DirectoryEntry::BlobFile { uid, gid, .. } => {
            Ok(FileAttr::blob(blob_size.unwrap_or(0), *uid, *gid))
        }
        DirectoryEntry::RealFile { real_path, .. } => real_file_attr(real_path),
    }
}

/// Stat a real file, forcing a regular-file kind and clearing write bits.
pub fn real_file_attr(real_path: &str) -> VfsResult<FileAttr> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(real_path)?;
    Ok(FileAttr {
        size: meta.len(),
        kind: FileType::File,
        perm: meta.mode() & 0o7777 & !0o222,
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
    })
}
