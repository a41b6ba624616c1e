//! searchfs server library
//!
//! SSH server with the SFTP subsystem over users' saved searches, plus the
//! housekeeping that expires searches and keeps per-user FUSE mounts alive.

pub mod constants;
pub mod housekeeping;
pub mod sftp;
pub mod ssh;

pub use housekeeping::{
    FuseSpawner, Housekeeping, HousekeepingHandle, ManagedInstance, MountAction, ProcessManager,
};
pub use sftp::SftpSession;
pub use ssh::{ServerContext, SshServer, SshServerConfig};
