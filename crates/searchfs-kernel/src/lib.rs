//! # searchfs-kernel
//!
//! Core of searchfs: a read-only virtual filesystem exposing each user's
//! saved searches as directory trees.
//!
//! A search is a query over a backing store plus the list of file paths its
//! result surfaced. Each search appears as a directory that masks the real
//! directory hierarchy down to exactly those files, next to a synthetic
//! `rset.<ext>` leaf holding the exported result.
//!
//! - [`vfs`] - path algebra, directory trees, the per-session translator
//! - [`registry`] - per-user view of searches across backing instances
//! - [`store`] - backing store traits and the SQLite implementation
//! - [`search`] / [`adapter`] - search creation and query rewriting
//! - [`config`] - server configuration

pub mod adapter;
pub mod config;
pub mod model;
pub mod registry;
pub mod search;
pub mod store;
pub mod vfs;

pub use adapter::{AdapterRegistry, EntityAdapter, FileSetAdapter, ResultSetAdapter, Rewrite};
pub use config::{ConfigError, ServerConfig};
pub use model::{BlobRef, ExportFormat, SearchFile, SearchReport};
pub use registry::{InstanceSession, SearchRegistry};
pub use search::{CreatedSearch, NewSearch, SearchError, SearchService};
pub use store::{Repository, SqliteRepository, StoreError, StoreResult, StoreSession, Value};
pub use vfs::{
    FileAttr, FileType, NamespaceLayout, PathTranslator, SessionState, TranslatorOptions,
    UnixIdentity, VfsError, VfsOps, VfsResult,
};
