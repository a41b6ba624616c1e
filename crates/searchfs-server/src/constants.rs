//! Server configuration constants.

use std::time::Duration;

pub use searchfs_kernel::config::DEFAULT_PORT as DEFAULT_SFTP_PORT;

/// Default bind address (localhost only).
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// SSH authentication rejection delay (prevents timing attacks).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// Name of the SSH subsystem served.
pub const SFTP_SUBSYSTEM: &str = "sftp";

pub use searchfs_kernel::vfs::{STATUS_ENTRY as FUSE_STATUS_ENTRY, UPDATE_ENTRY as FUSE_UPDATE_ENTRY};

/// Per-user mount directory below the mount base: `home/<login>/rql_download`.
pub const FUSE_USER_SUBDIR: &str = "rql_download";
