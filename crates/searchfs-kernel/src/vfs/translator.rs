//! Path translation: client paths to tree lookups and blob fetches.
//!
//! One [`PathTranslator`] serves one protocol session. It owns the current
//! tree behind an `Arc`; a refresh builds a complete new tree and swaps the
//! reference, so readers never observe a half-built namespace and a failed
//! rebuild leaves the previous tree serving.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use strum::Display;

use super::access::UnixIdentity;
use super::builder::{InstanceListing, SearchListing, TreeBuilder};
use super::error::{VfsError, VfsResult};
use super::ops::VfsOps;
use super::path::{NamespaceLayout, normalize, split_virtual_path};
use super::tree::{BlobLocator, BlobSizes, DirectoryEntry, VirtualDirectoryTree, real_file_attr};
use super::types::{DirListing, FileAttr, OpenFlags, SetAttr, StatFs};
use crate::model::BlobRef;
use crate::registry::SearchRegistry;

/// Lifecycle of a session's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Uninitialized,
    BuildingTree,
    Ready,
    Closed,
}

/// How a translator serves its session.
#[derive(Debug, Clone)]
pub struct TranslatorOptions {
    pub layout: NamespaceLayout,
    /// Real directory client paths are resolved against.
    pub base_dir: String,
    /// Owner reported for synthesized entries.
    pub identity: UnixIdentity,
    /// Check the identity's read permission before opening real files.
    pub enforce_access: bool,
    /// Rebuild when the root (or an instance directory) is listed.
    pub refresh_on_list: bool,
    /// Who the session is for, used in logs.
    pub login: String,
}

/// An opened leaf.
#[derive(Debug, Clone)]
pub enum OpenFile {
    Real { file: Arc<File>, attr: FileAttr },
    Blob { data: Arc<Vec<u8>>, attr: FileAttr },
}

impl OpenFile {
    pub fn attr(&self) -> &FileAttr {
        match self {
            OpenFile::Real { attr, .. } | OpenFile::Blob { attr, .. } => attr,
        }
    }

    /// Read up to `size` bytes at `offset`; empty past EOF.
    pub async fn read_at(&self, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        match self {
            OpenFile::Blob { data, .. } => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            OpenFile::Real { file, .. } => {
                let file = file.clone();
                tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; size as usize];
                    let mut filled = 0;
                    while filled < buf.len() {
                        match file.read_at(&mut buf[filled..], offset + filled as u64) {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                            Err(e) => return Err(VfsError::Io(e)),
                        }
                    }
                    buf.truncate(filled);
                    Ok(buf)
                })
                .await
                .map_err(|e| VfsError::other(format!("spawn_blocking: {}", e)))?
            }
        }
    }
}

/// What a normalized path resolves to.
enum Resolved {
    Directory,
    Real(String),
    Blob(BlobLocator),
}

/// Serves one session's namespace.
pub struct PathTranslator {
    registry: Arc<SearchRegistry>,
    options: TranslatorOptions,
    tree: RwLock<Option<Arc<VirtualDirectoryTree>>>,
    refresh_lock: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for PathTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathTranslator")
            .field("login", &self.options.login)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PathTranslator {
    pub fn new(registry: Arc<SearchRegistry>, options: TranslatorOptions) -> Self {
        Self {
            registry,
            options,
            tree: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState::Uninitialized),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn options(&self) -> &TranslatorOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<SearchRegistry> {
        &self.registry
    }

    /// The tree currently served.
    pub fn current_tree(&self) -> VfsResult<Arc<VirtualDirectoryTree>> {
        if self.state() == SessionState::Closed {
            return Err(VfsError::Closed);
        }
        self.tree.read().clone().ok_or(VfsError::NotReady)
    }

    /// Build a new tree from the registry and swap it in.
    ///
    /// Returns the entry count. Concurrent refreshes are serialized.
    pub async fn refresh(&self) -> VfsResult<usize> {
        let _guard = self.refresh_lock.lock().await;
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return Err(VfsError::Closed);
            }
            *state = SessionState::BuildingTree;
        }

        let started = Instant::now();
        let built = self.build().await;

        let mut state = self.state.lock();
        if *state == SessionState::Closed {
            return Err(VfsError::Closed);
        }
        match built {
            Ok(tree) => {
                let entries = tree.len();
                *self.tree.write() = Some(Arc::new(tree));
                *state = SessionState::Ready;
                tracing::info!(
                    login = %self.options.login,
                    entries,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tree rebuilt"
                );
                Ok(entries)
            }
            Err(e) => {
                *state = if self.tree.read().is_some() {
                    SessionState::Ready
                } else {
                    SessionState::Uninitialized
                };
                tracing::warn!(login = %self.options.login, error = %e, "tree rebuild failed");
                Err(e)
            }
        }
    }

    async fn build(&self) -> VfsResult<VirtualDirectoryTree> {
        let mut listings = Vec::with_capacity(self.registry.len());
        for (index, name) in self.registry.instance_names().into_iter().enumerate() {
            let mut searches = Vec::new();
            for title in self.registry.list_searches(index).await? {
                let files = self
                    .registry
                    .files_of(&title, index, &self.options.base_dir)
                    .await?;
                searches.push(SearchListing { title, files });
            }
            listings.push(InstanceListing { name, searches });
        }
        let identity = &self.options.identity;
        TreeBuilder::new(
            &self.options.layout,
            &self.options.base_dir,
            identity.uid,
            identity.gid,
        )
        .build(&listings)
    }

    /// Drop the tree and close the backing sessions.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.tree.write().take();
        self.registry.close().await;
        tracing::info!(login = %self.options.login, "session closed");
    }

    fn instance_index(&self, instance: Option<&str>) -> Option<usize> {
        match instance {
            None if !self.options.layout.is_multi() => Some(0),
            Some(name) => self.options.layout.instance_index(name),
            None => None,
        }
    }

    fn resolve(&self, tree: &VirtualDirectoryTree, key: &str) -> VfsResult<Resolved> {
        match tree.lookup(key) {
            Some(DirectoryEntry::VirtualDirectory { .. }) => Ok(Resolved::Directory),
            Some(DirectoryEntry::RealFile { real_path, .. }) => Ok(Resolved::Real(real_path.clone())),
            Some(DirectoryEntry::BlobFile { locator, .. }) => Ok(Resolved::Blob(locator.clone())),
            None => self
                .loose_attachment(tree, key)?
                .map(Resolved::Blob)
                .ok_or_else(|| VfsError::not_found(key)),
        }
    }

    /// `<dir>/<name>_<eid>` inside a search addresses an attachment even
    /// though the tree does not list it.
    fn loose_attachment(&self, tree: &VirtualDirectoryTree, key: &str) -> VfsResult<Option<BlobLocator>> {
        let vp = split_virtual_path(key, &self.options.base_dir, &self.options.layout)?;
        let Some(BlobRef::Attachment(eid)) = vp.file_entity() else {
            return Ok(None);
        };
        let parent_is_dir = super::path::parent_of(key)
            .and_then(|p| tree.lookup(p))
            .is_some_and(DirectoryEntry::is_dir);
        if vp.search_name.is_empty() || !parent_is_dir {
            return Ok(None);
        }
        Ok(self
            .instance_index(vp.instance.as_deref())
            .map(|instance| BlobLocator {
                instance,
                search: vp.search_name.clone(),
                blob: BlobRef::Attachment(eid),
            }))
    }

    async fn blob(&self, locator: &BlobLocator) -> VfsResult<Vec<u8>> {
        self.registry
            .blob_data(&locator.blob, locator.instance, Some(&locator.search))
            .await
    }

    fn blob_attr(&self, size: usize) -> FileAttr {
        FileAttr::blob(size as u64, self.options.identity.uid, self.options.identity.gid)
    }

    /// Attributes of a client path.
    pub async fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let tree = self.current_tree()?;
        let key = normalize(path);
        match self.resolve(&tree, &key)? {
            Resolved::Blob(locator) => {
                let size = self.blob(&locator).await?.len();
                Ok(self.blob_attr(size))
            }
            Resolved::Directory => tree.stat(&key),
            Resolved::Real(_) => {
                tokio::task::spawn_blocking(move || tree.stat(&key))
                    .await
                    .map_err(|e| VfsError::other(format!("spawn_blocking: {}", e)))?
            }
        }
    }

    /// List a directory. Entries whose backing file cannot be stat'ed are
    /// skipped.
    pub async fn list_directory(&self, path: &str) -> VfsResult<Vec<DirListing>> {
        let key = normalize(path);
        if self.options.refresh_on_list && self.is_refresh_point(&key)? {
            if let Err(e) = self.refresh().await {
                // Keep serving the previous generation if there is one.
                if self.tree.read().is_none() || matches!(e, VfsError::Closed) {
                    return Err(e);
                }
            }
        }

        let tree = self.current_tree()?;
        let mut sizes = BlobSizes::new();
        for (child, locator) in tree.blob_children(&key)? {
            match self.blob(&locator).await {
                Ok(data) => {
                    sizes.insert(child, data.len() as u64);
                }
                Err(e) => tracing::warn!(path = %child, error = %e, "blob size unavailable"),
            }
        }

        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for item in tree.list_directory(&key, &sizes)? {
                match item {
                    Ok(listing) => out.push(listing),
                    Err(e) => tracing::warn!(dir = %key, error = %e, "skipping unreadable entry"),
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| VfsError::other(format!("spawn_blocking: {}", e)))?
    }

    fn is_refresh_point(&self, key: &str) -> VfsResult<bool> {
        if key == "/" {
            return Ok(true);
        }
        let vp = split_virtual_path(key, &self.options.base_dir, &self.options.layout)?;
        Ok(vp.is_instance_dir())
    }

    /// Open a leaf for reading.
    pub async fn open_file(&self, path: &str, flags: OpenFlags) -> VfsResult<OpenFile> {
        if flags.wants_write() {
            self.rejected("open-for-write", path);
            return Err(VfsError::ReadOnly);
        }
        let tree = self.current_tree()?;
        let key = normalize(path);
        match self.resolve(&tree, &key)? {
            Resolved::Directory => Err(VfsError::is_a_directory(key)),
            Resolved::Blob(locator) => {
                let data = self.blob(&locator).await?;
                let attr = self.blob_attr(data.len());
                Ok(OpenFile::Blob {
                    data: Arc::new(data),
                    attr,
                })
            }
            Resolved::Real(real_path) => {
                let identity = self.options.enforce_access.then(|| self.options.identity.clone());
                tokio::task::spawn_blocking(move || {
                    let attr = real_file_attr(&real_path)?;
                    if let Some(identity) = identity {
                        identity.check_read(&key, &attr)?;
                    }
                    let file = File::open(&real_path)?;
                    Ok(OpenFile::Real {
                        file: Arc::new(file),
                        attr,
                    })
                })
                .await
                .map_err(|e| VfsError::other(format!("spawn_blocking: {}", e)))?
            }
        }
    }

    fn rejected(&self, op: &str, path: &str) {
        tracing::warn!(login = %self.options.login, op, path, "rejected mutating operation");
    }

    fn read_only_error<T>(&self, op: &str, path: &str) -> VfsResult<T> {
        self.rejected(op, path);
        Err(VfsError::ReadOnly)
    }

    fn unsupported<T>(&self, op: &str, path: &str) -> VfsResult<T> {
        self.rejected(op, path);
        Err(VfsError::not_supported(op))
    }
}

#[async_trait]
impl VfsOps for PathTranslator {
    async fn getattr(&self, path: &str) -> VfsResult<FileAttr> {
        self.stat(path).await
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirListing>> {
        self.list_directory(path).await
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<OpenFile> {
        self.open_file(path, flags).await
    }

    async fn read(&self, file: &OpenFile, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        file.read_at(offset, size).await
    }

    async fn realpath(&self, path: &str) -> VfsResult<String> {
        Ok(normalize(path))
    }

    async fn readlink(&self, path: &str) -> VfsResult<PathBuf> {
        self.unsupported("readlink", path)
    }

    async fn write(&self, path: &str, _offset: u64, _data: &[u8]) -> VfsResult<u32> {
        self.read_only_error("write", path)
    }

    async fn create(&self, path: &str, _mode: u32) -> VfsResult<FileAttr> {
        self.read_only_error("create", path)
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<FileAttr> {
        self.read_only_error("mkdir", path)
    }

    async fn unlink(&self, path: &str) -> VfsResult<()> {
        self.read_only_error("unlink", path)
    }

    async fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.read_only_error("rmdir", path)
    }

    async fn rename(&self, from: &str, _to: &str) -> VfsResult<()> {
        self.read_only_error("rename", from)
    }

    async fn truncate(&self, path: &str, _size: u64) -> VfsResult<()> {
        self.read_only_error("truncate", path)
    }

    async fn setattr(&self, path: &str, _attr: SetAttr) -> VfsResult<FileAttr> {
        self.read_only_error("setattr", path)
    }

    async fn symlink(&self, path: &str, _target: &str) -> VfsResult<FileAttr> {
        self.unsupported("symlink", path)
    }

    async fn link(&self, _oldpath: &str, newpath: &str) -> VfsResult<FileAttr> {
        self.unsupported("link", newpath)
    }

    async fn setxattr(&self, path: &str, _name: &str, _value: &[u8]) -> VfsResult<()> {
        self.unsupported("setxattr", path)
    }

    async fn removexattr(&self, path: &str, _name: &str) -> VfsResult<()> {
        self.unsupported("removexattr", path)
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        let tree = self.current_tree()?;
        Ok(StatFs::read_only(tree.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::registry::InstanceSession;
    use crate::search::{NewSearch, SearchService};
    use crate::store::{Repository, SqliteRepository, StoreSession};
    use crate::vfs::path::join_real;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        base: String,
        repo: SqliteRepository,
        alice: Arc<dyn StoreSession>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let base = dir.path().to_string_lossy().into_owned();
        for (rel, body) in [("study/subdir1/fichier1", "one"), ("study/subdir2/fichier2", "two")] {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, body).unwrap();
        }

        let repo = SqliteRepository::in_memory().unwrap();
        repo.create_user("alice", "pw").unwrap();
        let admin = repo.internal_session().await.unwrap();
        admin
            .execute("INSERT INTO scan (eid, label) VALUES (1, 'T1'), (2, 'T2')", vec![])
            .await
            .unwrap();
        let f1 = format!("{base}/study/subdir1/fichier1");
        let f2 = format!("{base}/study/subdir2/fichier2");
        repo.add_file_set(1, "raw", &[&f1]).unwrap();
        repo.add_file_set(2, "raw", &[&f2]).unwrap();

        let alice = repo.connect("alice", "pw").await.unwrap();
        create(&alice, "search1").await;
        Fixture {
            _dir: dir,
            base,
            repo,
            alice,
        }
    }

    async fn create(session: &Arc<dyn StoreSession>, title: &str) {
        SearchService::new(Arc::new(AdapterRegistry::with_defaults()), 30)
            .create(
                session.as_ref(),
                NewSearch {
                    title: title.into(),
                    query: "SELECT S.eid FROM scan S".into(),
                    expiration: None,
                },
            )
            .await
            .unwrap();
    }

    fn translator(fx: &Fixture, layout: NamespaceLayout, names: &[&str]) -> PathTranslator {
        let instances = names
            .iter()
            .map(|name| InstanceSession {
                name: (*name).to_owned(),
                session: fx.alice.clone(),
            })
            .collect();
        PathTranslator::new(
            Arc::new(SearchRegistry::new(instances)),
            TranslatorOptions {
                layout,
                base_dir: fx.base.clone(),
                identity: UnixIdentity::current(),
                enforce_access: true,
                refresh_on_list: true,
                login: "alice".into(),
            },
        )
    }

    fn names(listing: &[DirListing]) -> Vec<&str> {
        listing.iter().map(|l| l.name.as_str()).collect()
    }

    /// Every path reachable from the root, with its size and kind.
    async fn snapshot(t: &PathTranslator) -> Vec<(String, u64, bool)> {
        let mut out = Vec::new();
        let mut pending = vec!["/".to_owned()];
        while let Some(dir) = pending.pop() {
            for entry in t.list_directory(&dir).await.unwrap() {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                let path = join_real(&dir, &entry.name);
                if entry.attr.is_dir() {
                    pending.push(path.clone());
                }
                out.push((path, entry.attr.size, entry.attr.is_dir()));
            }
        }
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_not_ready_until_first_refresh() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        assert_eq!(t.state(), SessionState::Uninitialized);
        assert!(matches!(t.stat("/").await, Err(VfsError::NotReady)));

        t.refresh().await.unwrap();
        assert_eq!(t.state(), SessionState::Ready);
        assert!(t.stat("/").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_listing_and_reading() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);

        let root = t.list_directory("/").await.unwrap();
        assert_eq!(names(&root), vec![".", "..", "search1"]);

        let search = t.list_directory("/search1").await.unwrap();
        assert_eq!(names(&search), vec![".", "..", "study", "rset.json"]);
        let rset = search.iter().find(|l| l.name == "rset.json").unwrap();
        assert!(rset.attr.size > 0);
        assert!(rset.long_name.starts_with("-r--r--r--"));

        let data = t.read_all("/search1/study/subdir2/fichier2").await.unwrap();
        assert_eq!(data, b"two");

        let attr = t.getattr("/search1/study/subdir1/fichier1").await.unwrap();
        assert_eq!(attr.size, 3);
        assert!(!attr.is_writable());

        let rows: serde_json::Value =
            serde_json::from_slice(&t.read_all("/search1/rset.json").await.unwrap()).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();

        let file = t
            .open("/search1/study/subdir1/fichier1", OpenFlags::read())
            .await
            .unwrap();
        assert_eq!(t.read(&file, 1, 10).await.unwrap(), b"ne");
        assert!(t.read(&file, 10, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_rejected() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();

        assert!(t.read_only());
        assert!(matches!(
            t.open("/search1/rset.json", OpenFlags::write()).await,
            Err(VfsError::ReadOnly)
        ));
        assert!(matches!(t.mkdir("/search1/new", 0o755).await, Err(VfsError::ReadOnly)));
        assert!(matches!(t.unlink("/search1/rset.json").await, Err(VfsError::ReadOnly)));
        assert!(matches!(
            t.rename("/search1", "/other").await,
            Err(VfsError::ReadOnly)
        ));
        assert!(matches!(
            t.symlink("/search1/l", "/etc/passwd").await,
            Err(VfsError::NotSupported(_))
        ));
        assert!(matches!(
            t.readlink("/search1/rset.json").await,
            Err(VfsError::NotSupported(_))
        ));
        assert!(matches!(
            t.open("/search1/study", OpenFlags::read()).await,
            Err(VfsError::IsADirectory(_))
        ));
        assert!(matches!(
            t.getattr("/search1/nope").await,
            Err(VfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_mutations_leave_tree_alone() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();
        let before = snapshot(&t).await;
        assert!(before.iter().any(|(p, _, _)| p == "/search1/study/subdir1/fichier1"));

        let leaf = "/search1/study/subdir1/fichier1";
        assert!(t.mkdir("/search1/new", 0o755).await.is_err());
        assert!(t.mkdir("/search1/study/subdir1", 0o755).await.is_err());
        assert!(t.create("/search1/study/extra", 0o644).await.is_err());
        assert!(t.unlink(leaf).await.is_err());
        assert!(t.unlink("/search1/rset.json").await.is_err());
        assert!(t.rmdir("/search1/study/subdir2").await.is_err());
        assert!(t.rename(leaf, "/search1/moved").await.is_err());
        assert!(t.rename("/search1", "/other").await.is_err());
        assert!(t.write(leaf, 0, b"clobber").await.is_err());
        assert!(t.truncate(leaf, 0).await.is_err());
        let mut attr = SetAttr::new();
        attr.size = Some(0);
        attr.perm = Some(0o777);
        assert!(t.setattr(leaf, attr).await.is_err());
        assert!(t.symlink("/search1/l", leaf).await.is_err());
        assert!(t.link(leaf, "/search1/hard").await.is_err());

        assert_eq!(snapshot(&t).await, before);
        assert_eq!(t.read_all(leaf).await.unwrap(), b"one");
        assert_eq!(t.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_conflicting_rebuild_keeps_previous_tree() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();
        let before = snapshot(&t).await;

        // fichier1 becomes both a leaf and a directory in the next search.
        let deeper = format!("{}/study/subdir1/fichier1/deeper", fx.base);
        fx.repo.add_file_set(1, "derived", &[&deeper]).unwrap();
        create(&fx.alice, "search2").await;

        let err = t.refresh().await.unwrap_err();
        assert!(matches!(err, VfsError::ConflictingEntry(_)), "{err:?}");
        assert_eq!(t.state(), SessionState::Ready);

        // Root listings keep retrying the rebuild and keep serving the old tree.
        let root = t.list_directory("/").await.unwrap();
        assert_eq!(names(&root), vec![".", "..", "search1"]);
        assert_eq!(snapshot(&t).await, before);
        assert_eq!(
            t.read_all("/search1/study/subdir1/fichier1").await.unwrap(),
            b"one"
        );
        assert!(matches!(t.getattr("/search2").await, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_first_build_stays_uninitialized() {
        let fx = fixture().await;
        let deeper = format!("{}/study/subdir1/fichier1/deeper", fx.base);
        fx.repo.add_file_set(1, "derived", &[&deeper]).unwrap();
        create(&fx.alice, "search2").await;

        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        assert!(t.refresh().await.unwrap_err().is_construction_error());
        assert_eq!(t.state(), SessionState::Uninitialized);
        assert!(matches!(t.stat("/").await, Err(VfsError::NotReady)));
    }

    #[tokio::test]
    async fn test_dangling_file_skipped_in_listing() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();

        fs::remove_file(format!("{}/study/subdir1/fichier1", fx.base)).unwrap();
        let listing = t.list_directory("/search1/study/subdir1").await.unwrap();
        assert_eq!(names(&listing), vec![".", ".."]);
        assert!(matches!(
            t.open("/search1/study/subdir1/fichier1", OpenFlags::read()).await,
            Err(VfsError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_root_listing_refreshes() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();
        create(&fx.alice, "search2").await;

        // Not a refresh point.
        assert!(matches!(t.getattr("/search2").await, Err(VfsError::NotFound(_))));
        let root = t.list_directory("/").await.unwrap();
        assert_eq!(names(&root), vec![".", "..", "search1", "search2"]);
    }

    #[tokio::test]
    async fn test_multi_instance_layout() {
        let fx = fixture().await;
        let layout = NamespaceLayout::Multi {
            instances: vec!["1_a".into(), "2_b".into()],
        };
        let t = translator(&fx, layout, &["1_a", "2_b"]);

        let root = t.list_directory("/").await.unwrap();
        assert_eq!(names(&root), vec![".", "..", "1_a", "2_b"]);
        let inst = t.list_directory("/2_b").await.unwrap();
        assert_eq!(names(&inst), vec![".", "..", "search1"]);
        assert_eq!(
            t.read_all("/1_a/search1/study/subdir1/fichier1").await.unwrap(),
            b"one"
        );
    }

    #[tokio::test]
    async fn test_loose_attachment_by_eid() {
        let fx = fixture().await;
        let admin = fx.repo.internal_session().await.unwrap();
        let rows = admin
            .execute("SELECT rset_file FROM search WHERE title = 'search1'", vec![])
            .await
            .unwrap();
        let eid = rows[0][0].as_i64().unwrap();

        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();
        let direct = t.read_all(&format!("/search1/export_{eid}")).await.unwrap();
        let named = t.read_all("/search1/rset.json").await.unwrap();
        assert_eq!(direct, named);
        assert!(matches!(
            t.getattr("/search1/export_999999").await,
            Err(VfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_realpath_and_statfs() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();
        assert_eq!(
            t.realpath("/search1/../search1/./study/").await.unwrap(),
            "/search1/study"
        );
        assert_eq!(t.realpath("..").await.unwrap(), "/");
        let stats = t.statfs().await.unwrap();
        assert!(stats.files > 0);
    }

    #[tokio::test]
    async fn test_close() {
        let fx = fixture().await;
        let t = translator(&fx, NamespaceLayout::Single, &["1_db"]);
        t.refresh().await.unwrap();
        t.close().await;
        assert_eq!(t.state(), SessionState::Closed);
        assert!(matches!(t.stat("/").await, Err(VfsError::Closed)));
        assert!(matches!(t.refresh().await, Err(VfsError::Closed)));
    }
}
