//! Builds a [`VirtualDirectoryTree`] from flat per-search file lists.

use std::time::SystemTime;

use super::error::VfsResult;
use super::path::{NamespaceLayout, file_entity_of, join_real, join_virtual_path};
use super::tree::{BlobLocator, VirtualDirectoryTree};
use crate::model::{BlobRef, SearchFile};

/// One search and the files it references.
#[derive(Debug, Clone)]
pub struct SearchListing {
    pub title: String,
    pub files: Vec<SearchFile>,
}

/// The searches visible through one backing instance.
#[derive(Debug, Clone)]
pub struct InstanceListing {
    /// Display name (used as a path segment in multi-instance mode).
    pub name: String,
    pub searches: Vec<SearchListing>,
}

/// Materializes each file's directories root to leaf, so every parent
/// exists before its children are inserted.
#[derive(Debug, Clone)]
pub struct TreeBuilder<'a> {
    layout: &'a NamespaceLayout,
    base_dir: &'a str,
    uid: u32,
    gid: u32,
    created_at: SystemTime,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(layout: &'a NamespaceLayout, base_dir: &'a str, uid: u32, gid: u32) -> Self {
        Self {
            layout,
            base_dir,
            uid,
            gid,
            created_at: SystemTime::now(),
        }
    }

    /// Pin the creation timestamp of every synthesized directory.
    pub fn created_at(mut self, at: SystemTime) -> Self {
        self.created_at = at;
        self
    }

    /// Build the full namespace. Any construction error aborts the build.
    pub fn build(&self, instances: &[InstanceListing]) -> VfsResult<VirtualDirectoryTree> {
        let mut tree = VirtualDirectoryTree::new(self.uid, self.gid, self.created_at);

        for (index, instance) in instances.iter().enumerate() {
            let instance_name = self.layout.is_multi().then_some(instance.name.as_str());
            if let Some(name) = instance_name {
                tree.make_directory(&join_virtual_path(Some(name), "", ""), self.uid, self.gid, self.created_at)?;
            }

            for search in &instance.searches {
                if search.title.is_empty() || search.title.contains('/') {
                    tracing::warn!(title = %search.title, "skipping search with unusable title");
                    continue;
                }
                let dir = join_virtual_path(instance_name, &search.title, "");
                tree.make_directory(&dir, self.uid, self.gid, self.created_at)?;
                self.populate(&mut tree, &dir, index, search)?;
            }
        }
        Ok(tree)
    }

    /// Insert every file of one search, creating intermediate directories
    /// as its path is walked. Files outside the base directory are not
    /// shown. A path that is both a leaf and a directory is a conflict.
    fn populate(
        &self,
        tree: &mut VirtualDirectoryTree,
        search_dir: &str,
        instance: usize,
        search: &SearchListing,
    ) -> VfsResult<()> {
        let prefix = if self.base_dir.ends_with('/') {
            self.base_dir.to_owned()
        } else {
            format!("{}/", self.base_dir)
        };
        for file in &search.files {
            let Some(rest) = file.path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let segments: Vec<&str> = rest.split('/').collect();
            let Some((leaf, dirs)) = segments.split_last() else {
                continue;
            };
            if segments.iter().any(|s| matches!(*s, "" | "." | "..")) {
                tracing::warn!(path = %file.path, search = %search.title, "skipping unusable file path");
                continue;
            }

            let mut vdir = search_dir.to_owned();
            for dir in dirs {
                vdir = join_real(&vdir, dir);
                tree.make_directory(&vdir, self.uid, self.gid, self.created_at)?;
            }
            let vleaf = join_real(&vdir, leaf);
            if file.is_blob {
                let locator = BlobLocator {
                    instance,
                    search: search.title.clone(),
                    blob: file_entity_of(leaf).unwrap_or(BlobRef::OwnResult),
                };
                tree.add_blob(&vleaf, locator, self.uid, self.gid)?;
            } else {
                tree.add_file(&vleaf, &file.path, self.uid, self.gid)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::error::VfsError;
    use crate::vfs::tree::BlobSizes;

    fn study_files() -> Vec<SearchFile> {
        let mut files: Vec<SearchFile> = [
            "/tmp/study/subdir1/fichier1",
            "/tmp/study/subdir2/fichier2",
            "/tmp/study/subdir2/fichier3",
            "/tmp/study/subdir1/fichier4",
        ]
        .into_iter()
        .map(SearchFile::real)
        .collect();
        files.push(SearchFile::blob("/rset.json"));
        files
    }

    fn names(tree: &VirtualDirectoryTree, path: &str) -> Vec<String> {
        let sizes = BlobSizes::new();
        tree.list_directory(path, &sizes)
            .unwrap()
            .map(|l| l.unwrap().name)
            .skip(2)
            .collect()
    }

    fn single(files: Vec<SearchFile>) -> Vec<InstanceListing> {
        vec![InstanceListing {
            name: "1_db".into(),
            searches: vec![SearchListing {
                title: "search1".into(),
                files,
            }],
        }]
    }

    #[test]
    fn test_study_scenario() {
        let layout = NamespaceLayout::Single;
        let tree = TreeBuilder::new(&layout, "/", 0, 0)
            .build(&single(study_files()))
            .unwrap();

        assert_eq!(names(&tree, "/"), vec!["search1"]);
        assert_eq!(names(&tree, "/search1"), vec!["tmp", "rset.json"]);
        assert_eq!(names(&tree, "/search1/tmp/study"), vec!["subdir1", "subdir2"]);
        assert_eq!(names(&tree, "/search1/tmp/study/subdir1"), vec!["fichier1", "fichier4"]);
        assert_eq!(
            tree.get_real_path("/search1/tmp/study/subdir2/fichier3").unwrap(),
            "/tmp/study/subdir2/fichier3"
        );
    }

    #[test]
    fn test_base_dir_is_masked() {
        let layout = NamespaceLayout::Single;
        let mut files = study_files();
        files.pop();
        files.push(SearchFile::real("/elsewhere/hidden"));
        files.push(SearchFile::blob("/tmp/study/rset.json"));

        let tree = TreeBuilder::new(&layout, "/tmp/study", 0, 0)
            .build(&single(files))
            .unwrap();

        assert_eq!(names(&tree, "/search1"), vec!["subdir1", "subdir2", "rset.json"]);
        assert_eq!(names(&tree, "/search1/subdir1"), vec!["fichier1", "fichier4"]);
        assert!(tree.lookup("/search1/elsewhere").is_none());
        assert!(tree.lookup("/search1/tmp").is_none());
    }

    #[test]
    fn test_blob_leaf_locator() {
        let layout = NamespaceLayout::Single;
        let tree = TreeBuilder::new(&layout, "/", 0, 0)
            .build(&single(study_files()))
            .unwrap();
        let blobs = tree.blob_children("/search1").unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].0, "/search1/rset.json");
        assert_eq!(blobs[0].1.blob, BlobRef::OwnResult);
        assert_eq!(blobs[0].1.search, "search1");
    }

    #[test]
    fn test_multi_instance_level() {
        let layout = NamespaceLayout::Multi {
            instances: vec!["1_a".into(), "2_b".into()],
        };
        let instances = vec![
            InstanceListing {
                name: "1_a".into(),
                searches: vec![SearchListing {
                    title: "s".into(),
                    files: vec![SearchFile::real("/x/f")],
                }],
            },
            InstanceListing {
                name: "2_b".into(),
                searches: vec![SearchListing {
                    title: "s".into(),
                    files: vec![SearchFile::real("/y/g")],
                }],
            },
        ];
        let tree = TreeBuilder::new(&layout, "/", 7, 8).build(&instances).unwrap();

        assert_eq!(names(&tree, "/"), vec!["1_a", "2_b"]);
        assert_eq!(names(&tree, "/1_a"), vec!["s"]);
        assert_eq!(names(&tree, "/2_b/s/y"), vec!["g"]);
        assert_eq!(tree.stat("/1_a").unwrap().uid, 7);
    }

    #[test]
    fn test_leaf_and_directory_collide() {
        let layout = NamespaceLayout::Single;
        for files in [
            vec![SearchFile::real("/a"), SearchFile::real("/a/b")],
            vec![SearchFile::real("/a/b"), SearchFile::real("/a")],
        ] {
            let err = TreeBuilder::new(&layout, "/", 0, 0)
                .build(&single(files))
                .unwrap_err();
            assert!(matches!(err, VfsError::ConflictingEntry(ref p) if p == "/search1/a"), "{err:?}");
        }
    }

    #[test]
    fn test_real_file_shadowing_result_blob() {
        let layout = NamespaceLayout::Single;
        let files = vec![
            SearchFile::real("/tmp/study/rset.json"),
            SearchFile::real("/tmp/study/subdir1/fichier1"),
            SearchFile::blob("/tmp/study/rset.json"),
        ];
        let err = TreeBuilder::new(&layout, "/tmp/study", 0, 0)
            .build(&single(files))
            .unwrap_err();
        assert!(err.is_construction_error());
        assert!(matches!(err, VfsError::ConflictingEntry(ref p) if p == "/search1/rset.json"));
    }

    #[test]
    fn test_repeated_files_are_merged() {
        let layout = NamespaceLayout::Single;
        let mut files = study_files();
        files.extend(study_files());
        let tree = TreeBuilder::new(&layout, "/", 0, 0).build(&single(files)).unwrap();
        assert_eq!(names(&tree, "/search1"), vec!["tmp", "rset.json"]);
        assert_eq!(names(&tree, "/search1/tmp/study/subdir2"), vec!["fichier2", "fichier3"]);
    }

    #[test]
    fn test_skips_unusable_titles() {
        let layout = NamespaceLayout::Single;
        let instances = vec![InstanceListing {
            name: "1_db".into(),
            searches: vec![
                SearchListing {
                    title: "a/b".into(),
                    files: vec![],
                },
                SearchListing {
                    title: "ok".into(),
                    files: vec![],
                },
            ],
        }];
        let tree = TreeBuilder::new(&layout, "/", 0, 0).build(&instances).unwrap();
        assert_eq!(names(&tree, "/"), vec!["ok"]);
    }
}
