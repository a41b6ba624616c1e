//! Inode numbers for virtual paths.
//!
//! Numbers are handed out on first sight of a path and never reused, so an
//! inode the kernel still caches keeps naming the same path across tree
//! rebuilds. A path that vanished from the tree simply fails to stat.

use std::collections::HashMap;

use searchfs_kernel::vfs::{STATUS_ENTRY, UPDATE_ENTRY};

/// Inode of the mount root.
pub const ROOT_INO: u64 = 1;
/// Inode of the `.status` liveness probe.
pub const STATUS_INO: u64 = 2;
/// Inode of the `.update` rebuild trigger.
pub const UPDATE_INO: u64 = 3;

const FIRST_DYNAMIC_INO: u64 = 4;

/// Bidirectional path/inode map.
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next: FIRST_DYNAMIC_INO,
        };
        table.bind(ROOT_INO, "/".to_owned());
        table.bind(STATUS_INO, format!("/{STATUS_ENTRY}"));
        table.bind(UPDATE_INO, format!("/{UPDATE_ENTRY}"));
        table
    }

    fn bind(&mut self, ino: u64, path: String) {
        self.inodes.insert(path.clone(), ino);
        self.paths.insert(ino, path);
    }

    /// Path of an inode, if it was ever handed out.
    pub fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// Inode of `path`, if it already has one.
    pub fn get(&self, path: &str) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    /// Inode of `path`, allocating one on first use.
    pub fn intern(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.bind(ino, path.to_owned());
        ino
    }

    /// Inode of the directory holding `path` (the root is its own parent).
    pub fn parent(&mut self, path: &str) -> u64 {
        match path.rfind('/') {
            Some(0) | None => ROOT_INO,
            Some(idx) => self.intern(&path[..idx]),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// `parent/name` in virtual-path form.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
