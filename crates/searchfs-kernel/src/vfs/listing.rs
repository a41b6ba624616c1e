//! `ls -l` style display lines for directory listings.

use chrono::{DateTime, Duration, Utc};
use std::time::SystemTime;

use super::types::{FileAttr, FileType};

/// Render a permission string such as `dr-x------`.
pub fn mode_string(attr: &FileAttr) -> String {
    let mut out = String::with_capacity(10);
    out.push(match attr.kind {
        FileType::Directory => 'd',
        FileType::File => '-',
    });
    for shift in [6u32, 3, 0] {
        let bits = (attr.perm >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// One long listing line for `name`.
///
/// Entries modified within the last six months show the time of day,
/// older ones show the year.
pub fn long_line(name: &str, attr: &FileAttr) -> String {
    long_line_at(name, attr, SystemTime::now())
}

fn long_line_at(name: &str, attr: &FileAttr, now: SystemTime) -> String {
    let mtime: DateTime<Utc> = attr.mtime.into();
    let now: DateTime<Utc> = now.into();
    let stamp = if now.signed_duration_since(mtime) < Duration::days(182) && mtime <= now {
        mtime.format("%b %d %H:%M")
    } else {
        mtime.format("%b %d  %Y")
    };
    format!(
        "{} {:>4} {:<8} {:<8} {:>8} {} {}",
        mode_string(attr),
        attr.nlink,
        attr.uid,
        attr.gid,
        attr.size,
        stamp,
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::types::{DIR_PERM, ROOT_DIR_PERM};
    use std::time::Duration as StdDuration;

    #[test]
    fn test_mode_string() {
        let dir = FileAttr::directory(DIR_PERM, 0, 0, 0, SystemTime::UNIX_EPOCH);
        assert_eq!(mode_string(&dir), "dr-x------");
        let root = FileAttr::directory(ROOT_DIR_PERM, 0, 0, 0, SystemTime::UNIX_EPOCH);
        assert_eq!(mode_string(&root), "dr-xr-xr-x");
        assert_eq!(mode_string(&FileAttr::blob(1, 0, 0)), "-r--r--r--");
    }

    #[test]
    fn test_long_line_old_entry_shows_year() {
        let attr = FileAttr::blob(42, 1000, 100);
        let line = long_line_at("rset.json", &attr, SystemTime::now());
        assert!(line.starts_with("-r--r--r--    1 1000     100"));
        assert!(line.contains("Jan 01  1970"));
        assert!(line.ends_with(" rset.json"));
    }

    #[test]
    fn test_long_line_recent_entry_shows_time() {
        let now = SystemTime::UNIX_EPOCH + StdDuration::from_secs(86_400 * 10);
        let attr = FileAttr::directory(DIR_PERM, 1, 0, 0, SystemTime::UNIX_EPOCH + StdDuration::from_secs(86_400 * 9 + 3_600));
        let line = long_line_at("search1", &attr, now);
        assert!(line.contains("Jan 10 01:00"), "{line}");
    }
}
