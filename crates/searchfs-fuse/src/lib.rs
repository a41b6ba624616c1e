//! FUSE mount of one user's saved searches on one instance.
//!
//! The mount is read-only. Two pseudo-entries live at its root, outside
//! the search tree: stat'ing `.status` answers as long as the daemon is
//! alive, stat'ing `.update` rebuilds the tree first.

pub mod filesystem;
pub mod inodes;

use std::path::Path;

pub use filesystem::{SearchFs, to_fuse_attr};
pub use inodes::InodeTable;

/// Mount options for a searchfs mount.
pub fn mount_options(foreground: bool) -> Vec<fuser::MountOption> {
    let mut options = vec![
        fuser::MountOption::RO,
        fuser::MountOption::FSName("searchfs".to_owned()),
        fuser::MountOption::Subtype("searchfs".to_owned()),
    ];
    if foreground {
        options.push(fuser::MountOption::AutoUnmount);
    }
    options
}

/// Mount `fs` at `mountpoint`, blocking until it is unmounted.
pub fn mount(fs: SearchFs, mountpoint: &Path, foreground: bool) -> std::io::Result<()> {
    tracing::info!(
        login = %fs.translator().options().login,
        mountpoint = %mountpoint.display(),
        "mounting searchfs"
    );
    fuser::mount2(fs, mountpoint, &mount_options(foreground))
}
