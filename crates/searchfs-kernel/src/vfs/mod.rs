//! Virtual filesystem over saved searches.
//!
//! Key components:
//!
//! - [`VirtualDirectoryTree`] - One immutable generation of a user's namespace
//! - [`TreeBuilder`] - Builds a generation from the searches' file lists
//! - [`PathTranslator`] - Resolves client paths, owns the current generation
//! - [`VfsOps`] - Protocol surface shared by the FUSE and SFTP bindings
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: Operations use paths, not inode numbers.
//!   The FUSE binding handles inode ↔ path mapping locally.
//! - **Read-only**: Every mutating operation is rejected.
//! - **Whole-tree rebuilds**: A refresh builds a new generation and swaps it
//!   in; readers keep the generation they started with.

pub mod access;
pub mod builder;
mod error;
pub mod listing;
mod ops;
pub mod path;
pub mod translator;
pub mod tree;
mod types;

pub use access::UnixIdentity;
pub use builder::{InstanceListing, SearchListing, TreeBuilder};
pub use error::{VfsError, VfsResult};
pub use ops::VfsOps;
pub use path::{NamespaceLayout, VirtualPath, normalize, split_virtual_path};
pub use translator::{OpenFile, PathTranslator, SessionState, TranslatorOptions};
pub use tree::{BlobLocator, DirectoryEntry, VirtualDirectoryTree};
pub use types::{
    BLOB_FILE_PERM, DIR_PERM, DIR_SIZE, DirListing, FileAttr, FileType, OpenFlags, ROOT_DIR_PERM,
    STATUS_ENTRY, SetAttr, StatFs, UPDATE_ENTRY,
};
