//! Per-session view of the searches a user owns.
//!
//! Holds one backing session per attached instance. Every lookup is scoped
//! to the session user; a search the user does not own is `NotFound`, a
//! failing store is `BackingUnavailable`.

use std::sync::Arc;

use crate::model::{BlobRef, ExportFormat, SearchFile, SearchReport};
use crate::store::{StoreError, StoreSession, Value};
use crate::vfs::path::join_real;
use crate::vfs::{VfsError, VfsResult};

/// One attached backing instance.
#[derive(Clone)]
pub struct InstanceSession {
    /// Display name, e.g. `1_study`.
    pub name: String,
    pub session: Arc<dyn StoreSession>,
}

impl std::fmt::Debug for InstanceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSession")
            .field("name", &self.name)
            .field("login", &self.session.login())
            .finish()
    }
}

/// Resolves searches to file lists and blob payloads.
#[derive(Debug)]
pub struct SearchRegistry {
    instances: Vec<InstanceSession>,
}

impl SearchRegistry {
    pub fn new(instances: Vec<InstanceSession>) -> Self {
        Self { instances }
    }

    /// Display names in session order.
    pub fn instance_names(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn session(&self, instance: usize) -> VfsResult<&dyn StoreSession> {
        self.instances
            .get(instance)
            .map(|i| i.session.as_ref())
            .ok_or_else(|| VfsError::not_found(format!("instance #{instance}")))
    }

    /// Titles of the searches the session user owns on `instance`, by title.
    pub async fn list_searches(&self, instance: usize) -> VfsResult<Vec<String>> {
        let session = self.session(instance)?;
        let rows = session
            .execute(
                "SELECT title FROM search WHERE owner = :owner ORDER BY title",
                vec![(":owner", session.user_eid().into())],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_str).map(str::to_owned))
            .collect())
    }

    /// Whether the session user owns a search named `search`.
    pub async fn search_exists(&self, search: &str, instance: usize) -> VfsResult<bool> {
        let session = self.session(instance)?;
        let rows = session
            .execute(
                "SELECT 1 FROM search WHERE owner = :owner AND title = :title",
                vec![(":owner", session.user_eid().into()), (":title", search.into())],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Files of a search, followed by its own result as a blob entry at
    /// `base_dir/rset.<ext>`.
    pub async fn files_of(
        &self,
        search: &str,
        instance: usize,
        base_dir: &str,
    ) -> VfsResult<Vec<SearchFile>> {
        let session = self.session(instance)?;
        let rows = session
            .execute(
                "SELECT s.rset_type, f.data FROM search s \
                 LEFT JOIN file f ON f.eid = s.result_file \
                 WHERE s.owner = :owner AND s.title = :title",
                vec![(":owner", session.user_eid().into()), (":title", search.into())],
            )
            .await?;
        let row = rows.first().ok_or_else(|| VfsError::not_found(search))?;

        let format = row
            .first()
            .and_then(Value::as_str)
            .map(ExportFormat::from_stored)
            .unwrap_or(ExportFormat::Json);
        let report = match row.get(1).and_then(Value::as_blob) {
            Some(data) => SearchReport::from_slice(data)
                .map_err(|e| StoreError::Decode(format!("report of {search}: {e}")))?,
            None => SearchReport::default(),
        };

        let mut files: Vec<SearchFile> = report.files.into_iter().map(SearchFile::real).collect();
        files.push(SearchFile::blob(join_real(base_dir, &format.own_result_name())));
        Ok(files)
    }

    /// Bytes of a blob leaf.
    ///
    /// The own result needs the owning search's title; attachments are
    /// addressed by eid and must belong to the session user.
    pub async fn blob_data(
        &self,
        blob: &BlobRef,
        instance: usize,
        search: Option<&str>,
    ) -> VfsResult<Vec<u8>> {
        let session = self.session(instance)?;
        let owner: Value = session.user_eid().into();
        let rows = match blob {
            BlobRef::OwnResult => {
                let search = search.ok_or_else(|| VfsError::invalid_path("own result outside a search"))?;
                session
                    .execute(
                        "SELECT f.data FROM search s JOIN file f ON f.eid = s.rset_file \
                         WHERE s.owner = :owner AND s.title = :title",
                        vec![(":owner", owner), (":title", search.into())],
                    )
                    .await?
            }
            BlobRef::Attachment(eid) => {
                session
                    .execute(
                        "SELECT data FROM file WHERE eid = :eid AND owner = :owner",
                        vec![(":eid", (*eid).into()), (":owner", owner)],
                    )
                    .await?
            }
        };
        match rows.into_iter().next().and_then(|r| r.into_iter().next()) {
            Some(Value::Blob(data)) => Ok(data),
            Some(Value::Text(text)) => Ok(text.into_bytes()),
            _ => Err(VfsError::not_found(match blob {
                BlobRef::OwnResult => format!("result of {}", search.unwrap_or_default()),
                BlobRef::Attachment(eid) => format!("file #{eid}"),
            })),
        }
    }

    /// Close every backing session.
    pub async fn close(&self) {
        for instance in &self.instances {
            instance.session.close().await;
        }
    }
}
