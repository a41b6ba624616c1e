//! Unix identity that frames file access.

use std::ffi::CString;

use nix::unistd::{Gid, User, getgid, getgrouplist, getuid};

use super::error::{VfsError, VfsResult};
use super::types::FileAttr;

/// A resolved unix account: uid, primary gid and every group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl UnixIdentity {
    /// The identity of the running process.
    pub fn current() -> Self {
        let uid = getuid();
        let gid = getgid().as_raw();
        let name = User::from_uid(uid)
            .ok()
            .flatten()
            .map(|user| user.name)
            .unwrap_or_default();
        Self {
            name,
            uid: uid.as_raw(),
            gid,
            groups: vec![gid],
        }
    }

    /// Look a user up in the password database.
    pub fn lookup(name: &str) -> VfsResult<Self> {
        let user = User::from_name(name)
            .map_err(std::io::Error::from)?
            .ok_or_else(|| VfsError::not_found(format!("unix user {name}")))?;
        let groups = group_list(&user.name, user.gid);
        Ok(Self {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            name: user.name,
            groups,
        })
    }

    /// Whether this identity may read a file with `attr` (owner/group/other
    /// bits; root always may).
    pub fn can_read(&self, attr: &FileAttr) -> bool {
        if self.uid == 0 {
            return true;
        }
        let bits = if attr.uid == self.uid {
            attr.perm >> 6
        } else if self.groups.contains(&attr.gid) {
            attr.perm >> 3
        } else {
            attr.perm
        };
        bits & 0o4 != 0
    }

    /// `Ok` if readable, `PermissionDenied` otherwise.
    pub fn check_read(&self, path: &str, attr: &FileAttr) -> VfsResult<()> {
        if self.can_read(attr) {
            Ok(())
        } else {
            Err(VfsError::permission_denied(path))
        }
    }
}

/// Primary and supplementary groups of `name`; just the primary one when
/// the group database cannot be read.
fn group_list(name: &str, gid: Gid) -> Vec<u32> {
    let groups = CString::new(name)
        .ok()
        .and_then(|c_name| getgrouplist(&c_name, gid).ok());
    match groups {
        Some(groups) => groups.into_iter().map(Gid::as_raw).collect(),
        None => {
            tracing::debug!(user = name, "group list unavailable");
            vec![gid.as_raw()]
        }
    }
}
