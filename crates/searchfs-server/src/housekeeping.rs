//! Background maintenance: expired-search cleanup and per-user FUSE mounts.
//!
//! Runs as one task with two ticks. Cleanup deletes expired searches (at
//! startup, then every `cleanup_interval`). The reap tick collects exited
//! FUSE daemons and, when enabled, makes sure every search owner has a
//! live mount. Failures are logged and retried on the next tick.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use searchfs_kernel::store::Repository;
use searchfs_kernel::SearchService;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::constants::{FUSE_STATUS_ENTRY, FUSE_UPDATE_ENTRY, FUSE_USER_SUBDIR};

struct ManagedProcess {
    child: Child,
    label: String,
}

/// Children spawned by the server, reaped periodically.
#[derive(Default)]
pub struct ProcessManager {
    processes: Mutex<Vec<ManagedProcess>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, child: Child, label: impl Into<String>) {
        let label = label.into();
        tracing::debug!(label = %label, pid = ?child.id(), "process registered");
        self.processes.lock().push(ManagedProcess { child, label });
    }

    /// Whether a tracked (not yet reaped) process carries `label`.
    pub fn contains(&self, label: &str) -> bool {
        self.processes.lock().iter().any(|p| p.label == label)
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    /// Collect exited children. Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let mut processes = self.processes.lock();
        let before = processes.len();
        processes.retain_mut(|p| match p.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::info!(label = %p.label, %status, "process exited");
                false
            }
            Err(e) => {
                tracing::warn!(label = %p.label, error = %e, "cannot poll process, dropping it");
                false
            }
        });
        before - processes.len()
    }

    /// Kill and wait for every remaining child.
    pub async fn shutdown(&self) {
        let processes = std::mem::take(&mut *self.processes.lock());
        let waits = processes.into_iter().map(|mut p| async move {
            if let Err(e) = p.child.start_kill() {
                tracing::debug!(label = %p.label, error = %e, "kill failed");
            }
            if let Err(e) = p.child.wait().await {
                tracing::warn!(label = %p.label, error = %e, "wait failed");
            }
        });
        futures::future::join_all(waits).await;
    }
}

/// A backing instance as housekeeping sees it.
#[derive(Clone)]
pub struct ManagedInstance {
    /// Database path handed to spawned FUSE daemons.
    pub path: PathBuf,
    /// Namespace name, also the mount directory name.
    pub name: String,
    pub repository: Arc<dyn Repository>,
}

/// What [`FuseSpawner::ensure`] did for one mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountAction {
    /// A daemon was started.
    Spawned,
    /// The mount answered and was told to rebuild its tree.
    Refreshed,
    /// The mount answered its status probe but not the update one.
    Stale,
    /// A tracked daemon that does not answer yet.
    Pending,
}

/// Spawns one FUSE daemon per user and instance.
#[derive(Debug, Clone)]
pub struct FuseSpawner {
    pub binary: String,
    pub mount_base: PathBuf,
    pub base_dir: String,
    pub unix_username: Option<String>,
}

/// A single path component that cannot climb out of its parent.
fn is_plain_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

impl FuseSpawner {
    /// `<mount_base>/home/<login>/rql_download/<instance>`
    ///
    /// Logins and instance names must be plain path components.
    pub fn mount_point(&self, login: &str, instance: &str) -> std::io::Result<PathBuf> {
        for part in [login, instance] {
            if !is_plain_component(part) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{part:?} is not usable as a mount directory name"),
                ));
            }
        }
        Ok(self
            .mount_base
            .join("home")
            .join(login)
            .join(FUSE_USER_SUBDIR)
            .join(instance))
    }

    /// Make sure `login` has a live mount of `instance`.
    ///
    /// A mount answering its status probe, whether or not this server
    /// spawned it, is refreshed by stat'ing its update entry.
    pub async fn ensure(
        &self,
        login: &str,
        instance: &ManagedInstance,
        processes: &ProcessManager,
    ) -> std::io::Result<MountAction> {
        let mount = self.mount_point(login, &instance.name)?;
        let label = mount.display().to_string();
        if tokio::fs::metadata(mount.join(FUSE_STATUS_ENTRY)).await.is_ok() {
            return Ok(match tokio::fs::metadata(mount.join(FUSE_UPDATE_ENTRY)).await {
                Ok(_) => MountAction::Refreshed,
                Err(e) => {
                    tracing::debug!(mount = %label, error = %e, "update probe failed");
                    MountAction::Stale
                }
            });
        }
        if processes.contains(&label) {
            return Ok(MountAction::Pending);
        }

        tokio::fs::create_dir_all(&mount).await?;
        let child = self.command(login, &instance.path, &mount).spawn()?;
        tracing::info!(login, instance = %instance.name, mount = %label, "FUSE daemon spawned");
        processes.register(child, label);
        Ok(MountAction::Spawned)
    }

    fn command(&self, login: &str, instance: &Path, mount: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--instance")
            .arg(instance)
            .arg("--login")
            .arg(login)
            .arg("--mountpoint")
            .arg(mount)
            .arg("--base-dir")
            .arg(&self.base_dir)
            .arg("--foreground");
        if let Some(user) = &self.unix_username {
            cmd.arg("--unix-username").arg(user);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

/// Periodic maintenance over every backing instance.
pub struct Housekeeping {
    instances: Vec<ManagedInstance>,
    service: SearchService,
    processes: Arc<ProcessManager>,
    spawner: Option<FuseSpawner>,
    cleanup_interval: Duration,
    reap_interval: Duration,
}

impl Housekeeping {
    pub fn new(
        instances: Vec<ManagedInstance>,
        service: SearchService,
        spawner: Option<FuseSpawner>,
        cleanup_interval: Duration,
        reap_interval: Duration,
    ) -> Self {
        Self {
            instances,
            service,
            processes: Arc::new(ProcessManager::new()),
            spawner,
            cleanup_interval,
            reap_interval,
        }
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    /// Delete expired searches on every instance. Returns the total count.
    pub async fn cleanup(&self) -> usize {
        let today = Local::now().date_naive();
        let mut total = 0;
        for instance in &self.instances {
            let deleted = match instance.repository.internal_session().await {
                Ok(session) => {
                    let result = self.service.delete_expired(session.as_ref(), today).await;
                    session.close().await;
                    result
                }
                Err(e) => Err(e.into()),
            };
            match deleted {
                Ok(n) => total += n,
                Err(e) => {
                    tracing::warn!(instance = %instance.name, error = %e, "expired search cleanup failed")
                }
            }
        }
        total
    }

    /// Spawn missing mounts for every search owner. Returns how many were
    /// spawned.
    pub async fn spawn_user_mounts(&self) -> usize {
        let Some(spawner) = &self.spawner else {
            return 0;
        };
        let mut spawned = 0;
        for instance in &self.instances {
            let owners = match instance.repository.internal_session().await {
                Ok(session) => {
                    let owners = self.service.owners(session.as_ref()).await;
                    session.close().await;
                    owners
                }
                Err(e) => Err(e.into()),
            };
            let owners = match owners {
                Ok(owners) => owners,
                Err(e) => {
                    tracing::warn!(instance = %instance.name, error = %e, "cannot list search owners");
                    continue;
                }
            };
            for login in owners {
                match spawner.ensure(&login, instance, &self.processes).await {
                    Ok(MountAction::Spawned) => spawned += 1,
                    Ok(action) => tracing::trace!(login = %login, instance = %instance.name, ?action, "mount checked"),
                    Err(e) => {
                        tracing::warn!(login = %login, instance = %instance.name, error = %e, "FUSE spawn failed")
                    }
                }
            }
        }
        spawned
    }

    /// Start the maintenance task.
    pub fn spawn(self) -> HousekeepingHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let processes = self.processes.clone();

        let task = tokio::spawn(async move {
            let mut cleanup = tokio::time::interval(self.cleanup_interval);
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reap = tokio::time::interval(self.reap_interval);
            reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("housekeeping shutting down");
                        break;
                    }
                    _ = cleanup.tick() => {
                        let deleted = self.cleanup().await;
                        tracing::debug!(deleted, "cleanup tick");
                    }
                    _ = reap.tick() => {
                        let reaped = self.processes.reap();
                        let spawned = self.spawn_user_mounts().await;
                        tracing::debug!(reaped, spawned, running = self.processes.len(), "reap tick");
                    }
                }
            }
        });

        HousekeepingHandle {
            shutdown_tx,
            task,
            processes,
        }
    }
}

/// Running maintenance task.
pub struct HousekeepingHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    processes: Arc<ProcessManager>,
}

impl HousekeepingHandle {
    /// Stop the task, then kill every spawned daemon.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "housekeeping task failed");
        }
        self.processes.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as Days;
    use searchfs_kernel::search::NewSearch;
    use searchfs_kernel::store::StoreSession as _;
    use searchfs_kernel::{AdapterRegistry, SqliteRepository};

    fn service() -> SearchService {
        SearchService::new(Arc::new(AdapterRegistry::with_defaults()), 30)
    }

    async fn instance() -> ManagedInstance {
        let repo = SqliteRepository::in_memory().unwrap();
        repo.create_user("alice", "pw").unwrap();
        let admin = repo.internal_session().await.unwrap();
        admin
            .execute("INSERT INTO scan (eid, label) VALUES (1, 'T1')", vec![])
            .await
            .unwrap();
        repo.add_file_set(1, "raw", &["/data/a"]).unwrap();
        ManagedInstance {
            path: PathBuf::from(":memory:"),
            name: "1_db".into(),
            repository: Arc::new(repo),
        }
    }

    async fn add_search(instance: &ManagedInstance, title: &str, days: i64) {
        let alice = instance.repository.connect("alice", "pw").await.unwrap();
        service()
            .create(
                alice.as_ref(),
                NewSearch {
                    title: title.into(),
                    query: "SELECT S.eid FROM scan S".into(),
                    expiration: Some(Local::now().date_naive() + Days::days(days)),
                },
            )
            .await
            .unwrap();
    }

    fn spawner(mount_base: &Path) -> FuseSpawner {
        FuseSpawner {
            binary: "true".into(),
            mount_base: mount_base.to_path_buf(),
            base_dir: "/".into(),
            unix_username: None,
        }
    }

    #[test]
    fn test_mount_point_layout() {
        let spawner = spawner(Path::new("/srv/searchfs"));
        assert_eq!(
            spawner.mount_point("alice", "1_db").unwrap(),
            PathBuf::from("/srv/searchfs/home/alice/rql_download/1_db")
        );
    }

    #[test]
    fn test_mount_point_rejects_escaping_logins() {
        let spawner = spawner(Path::new("/srv/searchfs"));
        for login in ["../x", "..", ".", "", "a/b", "/etc"] {
            let err = spawner.mount_point(login, "1_db").unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "login {login:?}");
        }
        assert!(spawner.mount_point("alice", "../1_db").is_err());
        assert!(spawner.mount_point("al.ice", "1_db").is_ok());
    }

    #[tokio::test]
    async fn test_escaping_login_is_not_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance().await;
        let processes = ProcessManager::new();
        let err = spawner(dir.path())
            .ensure("../../x", &instance, &processes)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(processes.is_empty());
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_expired() {
        let instance = instance().await;
        add_search(&instance, "old", -2).await;
        add_search(&instance, "fresh", 5).await;

        let housekeeping = Housekeeping::new(
            vec![instance.clone()],
            service(),
            None,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert_eq!(housekeeping.cleanup().await, 1);
        assert_eq!(housekeeping.cleanup().await, 0);

        let admin = instance.repository.internal_session().await.unwrap();
        let rows = admin.execute("SELECT title FROM search", vec![]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_str(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_process_manager_reaps_exited() {
        let processes = ProcessManager::new();
        let child = Command::new("true").spawn().unwrap();
        processes.register(child, "short");
        assert!(processes.contains("short"));

        for _ in 0..50 {
            if processes.reap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(processes.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_kills_children() {
        let processes = ProcessManager::new();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        processes.register(child, "sleeper");
        assert_eq!(processes.reap(), 0);
        processes.shutdown().await;
        assert!(processes.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_user_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance().await;
        add_search(&instance, "s1", 5).await;

        let housekeeping = Housekeeping::new(
            vec![instance],
            service(),
            Some(spawner(dir.path())),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert_eq!(housekeeping.spawn_user_mounts().await, 1);
        assert!(dir.path().join("home/alice/rql_download/1_db").is_dir());
        // Still tracked, not spawned twice.
        assert_eq!(housekeeping.spawn_user_mounts().await, 0);
        housekeeping.processes().shutdown().await;
    }

    #[tokio::test]
    async fn test_live_mount_is_not_respawned() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance().await;
        let spawner = spawner(dir.path());
        let mount = spawner.mount_point("alice", "1_db").unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::write(mount.join(FUSE_STATUS_ENTRY), b"").unwrap();
        std::fs::write(mount.join(FUSE_UPDATE_ENTRY), b"").unwrap();

        let processes = ProcessManager::new();
        assert_eq!(
            spawner.ensure("alice", &instance, &processes).await.unwrap(),
            MountAction::Refreshed
        );
        assert!(processes.is_empty());
    }

    #[tokio::test]
    async fn test_tracked_mount_is_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let instance = instance().await;
        let spawner = spawner(dir.path());
        let mount = spawner.mount_point("alice", "1_db").unwrap();
        std::fs::create_dir_all(&mount).unwrap();

        // A daemon we spawned earlier, still running.
        let processes = ProcessManager::new();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        processes.register(child, mount.display().to_string());

        // Not answering yet.
        assert_eq!(
            spawner.ensure("alice", &instance, &processes).await.unwrap(),
            MountAction::Pending
        );

        // Answers status, but the update entry is missing.
        std::fs::write(mount.join(FUSE_STATUS_ENTRY), b"").unwrap();
        assert_eq!(
            spawner.ensure("alice", &instance, &processes).await.unwrap(),
            MountAction::Stale
        );

        // A search added since the spawn is picked up through the update entry.
        add_search(&instance, "late", 5).await;
        std::fs::write(mount.join(FUSE_UPDATE_ENTRY), b"").unwrap();
        assert_eq!(
            spawner.ensure("alice", &instance, &processes).await.unwrap(),
            MountAction::Refreshed
        );
        assert_eq!(processes.len(), 1);
        processes.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_shutdown() {
        let housekeeping = Housekeeping::new(
            vec![instance().await],
            service(),
            None,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let handle = housekeeping.spawn();
        handle.shutdown().await;
    }
}
