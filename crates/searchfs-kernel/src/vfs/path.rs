//! Virtual path algebra.
//!
//! A client path is `/<search>/<relative>` in single-instance mode and
//! `/<instance>/<search>/<relative>` in multi-instance mode. The relative
//! part maps onto the real filesystem under the configured base directory.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

use super::error::{VfsError, VfsResult};
use crate::model::{BlobRef, OWN_RESULT_BASENAME, SearchFile};

/// Leaf names ending in `_<digits>` address a backing-store attachment.
// Literal pattern, cannot fail to compile.
static ATTACHMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+_(\d+)$").expect("attachment pattern"));

/// Which namespace shape a session serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceLayout {
    /// Root lists search names directly.
    Single,
    /// Root lists instance names, each listing its searches.
    Multi {
        /// Display names, in session order.
        instances: Vec<String>,
    },
}

impl NamespaceLayout {
    /// True when the first path segment names an instance.
    pub fn is_multi(&self) -> bool {
        matches!(self, NamespaceLayout::Multi { .. })
    }

    /// Position of an instance display name.
    pub fn instance_index(&self, name: &str) -> Option<usize> {
        match self {
            NamespaceLayout::Single => None,
            NamespaceLayout::Multi { instances } => instances.iter().position(|n| n == name),
        }
    }
}

/// A client path decomposed into its namespace components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath {
    /// Search title, empty at the root (or at an instance directory).
    pub search_name: String,
    /// Path below the search directory. Never starts with `/`.
    pub relative_path: String,
    /// Real directory the relative path is resolved against.
    pub base_dir: String,
    /// Instance segment, present only in multi-instance mode.
    pub instance: Option<String>,
}

impl VirtualPath {
    /// The namespace root.
    pub fn is_root(&self) -> bool {
        self.instance.is_none() && self.search_name.is_empty()
    }

    /// An instance directory (multi-instance mode only).
    pub fn is_instance_dir(&self) -> bool {
        self.instance.is_some() && self.search_name.is_empty()
    }

    /// A search's top directory.
    pub fn is_search_dir(&self) -> bool {
        !self.search_name.is_empty() && self.relative_path.is_empty()
    }

    /// Re-join into a normalized client path.
    pub fn to_virtual(&self) -> String {
        join_virtual_path(
            self.instance.as_deref(),
            &self.search_name,
            &self.relative_path,
        )
    }

    /// The real path this virtual path denotes: `join(base_dir, relative_path)`.
    pub fn real_path(&self) -> PathBuf {
        PathBuf::from(join_real(&self.base_dir, &self.relative_path))
    }

    /// Classify the final relative segment as a synthetic blob leaf.
    pub fn file_entity(&self) -> Option<BlobRef> {
        if self.relative_path.is_empty() {
            return None;
        }
        let leaf = self
            .relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path);
        file_entity_of(leaf)
    }
}

/// Classify a leaf name: `rset` / `rset.<ext>` is the search's own result,
/// `<anything>_<digits>` is an attachment.
pub fn file_entity_of(leaf: &str) -> Option<BlobRef> {
    if leaf == OWN_RESULT_BASENAME
        || leaf
            .strip_prefix(OWN_RESULT_BASENAME)
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|ext| !ext.is_empty() && !ext.contains('.'))
    {
        return Some(BlobRef::OwnResult);
    }
    ATTACHMENT_RE
        .captures(leaf)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .map(BlobRef::Attachment)
}

/// Split an absolute client path.
///
/// Empty segments are dropped, so `/s`, `/s/` and `//s//` all name the
/// search directory with an empty relative path.
pub fn split_virtual_path(
    path: &str,
    base_dir: &str,
    layout: &NamespaceLayout,
) -> VfsResult<VirtualPath> {
    if !path.starts_with('/') {
        return Err(VfsError::invalid_path(format!("not absolute: {path}")));
    }
    let mut parts = path.split('/').filter(|s| !s.is_empty());

    let instance = if layout.is_multi() {
        parts.next().map(str::to_owned)
    } else {
        None
    };
    let search_name = parts.next().unwrap_or_default().to_owned();
    let relative_path = parts.collect::<Vec<_>>().join("/");

    Ok(VirtualPath {
        search_name,
        relative_path,
        base_dir: base_dir.to_owned(),
        instance,
    })
}

/// Join namespace components back into a client path.
pub fn join_virtual_path(instance: Option<&str>, search: &str, relative: &str) -> String {
    let mut out = String::from("/");
    for segment in [instance.unwrap_or(""), search, relative] {
        let segment = segment.trim_matches('/');
        if segment.is_empty() {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(segment);
    }
    out
}

/// Join a real directory and a relative path with exactly one separator.
pub fn join_real(dir: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return dir.to_owned();
    }
    if dir.ends_with('/') {
        format!("{dir}{relative}")
    } else {
        format!("{dir}/{relative}")
    }
}

/// Lexically normalize an absolute path, resolving `.` and `..`.
///
/// `..` never climbs above `/`. Relative input is treated as rooted.
pub fn normalize(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
    format!("/{}", stack.join("/"))
}

/// Parent of a normalized path, `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Final segment of a normalized path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Group `files` by the first segment below `dir`.
///
/// Yields `dir/<segment>` once per distinct segment, in first-appearance
/// order, carrying the blob flag of the first file that produced it.
pub fn filter_files<'a>(
    files: &'a [SearchFile],
    dir: &str,
) -> impl Iterator<Item = SearchFile> + 'a {
    let prefix = if dir.ends_with('/') {
        dir.to_owned()
    } else {
        format!("{dir}/")
    };
    let mut seen = std::collections::HashSet::new();
    files.iter().filter_map(move |f| {
        let rest = f.path.strip_prefix(prefix.as_str())?;
        let head = rest.split('/').next().filter(|h| !h.is_empty())?;
        let entry = format!("{prefix}{head}");
        if seen.insert(entry.clone()) {
            Some(SearchFile {
                path: entry,
                is_blob: f.is_blob,
            })
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi() -> NamespaceLayout {
        NamespaceLayout::Multi {
            instances: vec!["1_alpha".into(), "2_beta".into()],
        }
    }

    #[test]
    fn test_split_single_instance() {
        let vp = split_virtual_path("/search1/tmp/study", "/", &NamespaceLayout::Single).unwrap();
        assert_eq!(vp.search_name, "search1");
        assert_eq!(vp.relative_path, "tmp/study");
        assert_eq!(vp.instance, None);
        assert!(!vp.relative_path.starts_with('/'));

        let root = split_virtual_path("/", "/", &NamespaceLayout::Single).unwrap();
        assert!(root.is_root());
    }

    #[test]
    fn test_split_trailing_slash_equivalence() {
        let layout = NamespaceLayout::Single;
        let a = split_virtual_path("/search1", "/", &layout).unwrap();
        let b = split_virtual_path("/search1/", "/", &layout).unwrap();
        assert_eq!(a, b);
        assert!(a.is_search_dir());
    }

    #[test]
    fn test_split_multi_instance() {
        let vp = split_virtual_path("/1_alpha/s/a/b", "/data", &multi()).unwrap();
        assert_eq!(vp.instance.as_deref(), Some("1_alpha"));
        assert_eq!(vp.search_name, "s");
        assert_eq!(vp.relative_path, "a/b");
        assert_eq!(vp.real_path(), PathBuf::from("/data/a/b"));

        let inst = split_virtual_path("/2_beta", "/", &multi()).unwrap();
        assert!(inst.is_instance_dir());
        assert_eq!(multi().instance_index("2_beta"), Some(1));
    }

    #[test]
    fn test_split_rejects_relative() {
        let err = split_virtual_path("search1", "/", &NamespaceLayout::Single).unwrap_err();
        assert!(matches!(err, VfsError::InvalidPath(_)));
    }

    #[test]
    fn test_split_join_round_trip() {
        let cases = [
            ("/", NamespaceLayout::Single),
            ("/s", NamespaceLayout::Single),
            ("/s/a/b/", NamespaceLayout::Single),
            ("/1_alpha", multi()),
            ("/1_alpha/s/x", multi()),
        ];
        for (path, layout) in cases {
            let vp = split_virtual_path(path, "/", &layout).unwrap();
            let rejoined = vp.to_virtual();
            assert_eq!(rejoined, normalize(path), "round trip of {path}");
            assert_eq!(split_virtual_path(&rejoined, "/", &layout).unwrap(), vp);
        }
    }

    #[test]
    fn test_file_entity_patterns() {
        assert_eq!(file_entity_of("rset"), Some(BlobRef::OwnResult));
        assert_eq!(file_entity_of("rset.json"), Some(BlobRef::OwnResult));
        assert_eq!(file_entity_of("report_1234"), Some(BlobRef::Attachment(1234)));
        assert_eq!(file_entity_of("rsetx"), None);
        assert_eq!(file_entity_of("_12"), None);
        assert_eq!(file_entity_of("scan.nii"), None);

        let vp = split_virtual_path("/s/dir/rset.csv", "/", &NamespaceLayout::Single).unwrap();
        assert_eq!(vp.file_entity(), Some(BlobRef::OwnResult));
        let vp = split_virtual_path("/s", "/", &NamespaceLayout::Single).unwrap();
        assert_eq!(vp.file_entity(), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/./b/../c/"), "/a/c");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("a/b"), "/a/b");
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/a/b"), Some("/a"));
        assert_eq!(basename("/a/b"), "b");
    }

    #[test]
    fn test_join_real() {
        assert_eq!(join_real("/", "tmp/x"), "/tmp/x");
        assert_eq!(join_real("/data", ""), "/data");
        assert_eq!(join_real("/data/", "x"), "/data/x");
    }

    #[test]
    fn test_filter_files_groups_subtrees() {
        let files: Vec<SearchFile> = [
            "/subdir1/fichier1",
            "/subdir2/fichier2",
            "/subdir2/fichier3",
            "/subdir1/fichier4",
            "/subdir1/subsubdir1/fichier1",
        ]
        .into_iter()
        .map(SearchFile::real)
        .collect();

        let got: Vec<String> = filter_files(&files, "/subdir1").map(|f| f.path).collect();
        assert_eq!(
            got,
            vec!["/subdir1/fichier1", "/subdir1/fichier4", "/subdir1/subsubdir1"]
        );

        let top: Vec<String> = filter_files(&files, "/").map(|f| f.path).collect();
        assert_eq!(top, vec!["/subdir1", "/subdir2"]);
    }
}
