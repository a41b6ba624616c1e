//! Search creation and expiry.
//!
//! Creating a search runs its query once through the registered adapters,
//! stores the serialized result and a JSON report listing the referenced
//! files, and records the search with an expiration date.

use chrono::{Duration, Local, NaiveDate};
use indexmap::IndexSet;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

use crate::adapter::{AdapterRegistry, ResultSetAdapter};
use crate::model::{ExportFormat, OWN_RESULT_BASENAME, REPORT_BLOB_NAME, SearchReport};
use crate::store::{Row, StoreError, StoreSession, Value};
use crate::vfs::VfsError;

/// Search creation errors.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The search definition was rejected.
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The result could not be serialized.
    #[error("export: {0}")]
    Export(String),
}

impl From<SearchError> for VfsError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Validation(msg) => VfsError::validation(msg),
            SearchError::Store(e) => e.into(),
            SearchError::Export(msg) => VfsError::other(msg),
        }
    }
}

/// Date format of `search.expiration_date`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// Literal pattern, cannot fail to compile.
static BINDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?")
        .expect("binding pattern")
});

const NOT_AN_ALIAS: &[&str] = &[
    "WHERE", "JOIN", "ON", "LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "NATURAL", "GROUP",
    "ORDER", "LIMIT", "HAVING", "UNION", "USING",
];

/// A table bound in a query and the label it is referenced by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBinding {
    pub table: String,
    pub label: String,
}

/// Tables bound by `FROM` / `JOIN`, with their alias (or the table name).
pub fn entity_bindings(query: &str) -> Vec<EntityBinding> {
    BINDING_RE
        .captures_iter(query)
        .filter_map(|caps| {
            let table = caps.get(1)?.as_str().to_owned();
            let label = caps
                .get(2)
                .map(|m| m.as_str())
                .filter(|a| !NOT_AN_ALIAS.iter().any(|k| k.eq_ignore_ascii_case(a)))
                .unwrap_or(&table)
                .to_owned();
            Some(EntityBinding { table, label })
        })
        .collect()
}

/// A search to create.
#[derive(Debug, Clone)]
pub struct NewSearch {
    pub title: String,
    pub query: String,
    /// Defaults to today plus the configured delay.
    pub expiration: Option<NaiveDate>,
}

/// What [`SearchService::create`] stored.
#[derive(Debug, Clone)]
pub struct CreatedSearch {
    pub eid: i64,
    pub format: ExportFormat,
    pub report: SearchReport,
    pub expiration: NaiveDate,
}

/// Creates and expires searches.
#[derive(Debug, Clone)]
pub struct SearchService {
    adapters: Arc<AdapterRegistry>,
    default_expiration_days: u32,
}

impl SearchService {
    pub fn new(adapters: Arc<AdapterRegistry>, default_expiration_days: u32) -> Self {
        Self {
            adapters,
            default_expiration_days,
        }
    }

    /// Create a search owned by the session user.
    pub async fn create(
        &self,
        session: &dyn StoreSession,
        new: NewSearch,
    ) -> Result<CreatedSearch, SearchError> {
        let owner = session.user_eid();
        if new.title.is_empty() || new.title.contains('/') {
            return Err(SearchError::Validation(format!(
                "invalid search title: {:?}",
                new.title
            )));
        }

        let existing = session
            .execute(
                "SELECT eid FROM search WHERE owner = :owner AND title = :title",
                vec![(":owner", owner.into()), (":title", new.title.clone().into())],
            )
            .await?;
        if !existing.is_empty() {
            return Err(SearchError::Validation(format!(
                "a search named '{}' already exists",
                new.title
            )));
        }

        let selected: Vec<(Arc<dyn ResultSetAdapter>, String)> = entity_bindings(&new.query)
            .into_iter()
            .filter_map(|b| self.adapters.get(&b.table).map(|a| (a, b.label)))
            .collect();
        if selected.is_empty() {
            return Err(SearchError::Validation(
                "no file adapter applies to the entities of this query".into(),
            ));
        }
        let formats: HashSet<ExportFormat> = selected.iter().map(|(a, _)| a.export_format()).collect();
        let format = match formats.into_iter().collect::<Vec<_>>().as_slice() {
            [one] => *one,
            many => {
                return Err(SearchError::Validation(format!(
                    "cannot mix export types: {many:?}"
                )));
            }
        };

        let mut global = new.query.clone();
        let mut upper_file_index = 0;
        for (suffix, (adapter, label)) in selected.iter().enumerate() {
            let rewrite = adapter.rewrite(&global, label, suffix + 1)?;
            global = rewrite.query;
            upper_file_index += rewrite.file_columns;
        }

        let rows = match session.execute(&global, vec![]).await {
            Ok(rows) => rows,
            Err(StoreError::Sqlite(e)) => {
                return Err(SearchError::Validation(format!("query failed: {e}")));
            }
            Err(e) => return Err(e.into()),
        };

        let payload = export_rows(format, &rows)?;
        // Paths are recorded as returned; their existence is not checked.
        let files = if format.collects_files() {
            collect_files(&rows, upper_file_index)
        } else {
            Vec::new()
        };
        let report = SearchReport {
            rql: global,
            files,
            nonexistent_files: Vec::new(),
            upper_file_index,
        };
        let report_bytes = report
            .to_vec()
            .map_err(|e| SearchError::Export(e.to_string()))?;

        let rset_eid = insert_file(session, OWN_RESULT_BASENAME, format.content_type(), payload).await?;
        let result_eid = insert_file(session, REPORT_BLOB_NAME, "text/json", report_bytes).await?;

        let expiration = new.expiration.unwrap_or_else(|| {
            Local::now().date_naive() + Duration::days(i64::from(self.default_expiration_days))
        });
        let rows = session
            .execute(
                "INSERT INTO search (owner, title, query, expiration_date, rset_type, result_file, rset_file) \
                 VALUES (:owner, :title, :query, :expiration, :rset_type, :result, :rset) RETURNING eid",
                vec![
                    (":owner", owner.into()),
                    (":title", new.title.clone().into()),
                    (":query", new.query.into()),
                    (":expiration", expiration.format(DATE_FORMAT).to_string().into()),
                    (":rset_type", format.to_string().into()),
                    (":result", result_eid.into()),
                    (":rset", rset_eid.into()),
                ],
            )
            .await?;
        let eid = first_i64(&rows)?;

        tracing::info!(
            login = session.login(),
            title = %new.title,
            files = report.files.len(),
            %format,
            "search created"
        );
        Ok(CreatedSearch {
            eid,
            format,
            report,
            expiration,
        })
    }

    /// Delete searches whose expiration date is before `today`, with their
    /// stored result and report.
    pub async fn delete_expired(
        &self,
        session: &dyn StoreSession,
        today: NaiveDate,
    ) -> Result<usize, SearchError> {
        let deleted = session
            .execute(
                "DELETE FROM search WHERE expiration_date < :today RETURNING result_file, rset_file",
                vec![(":today", today.format(DATE_FORMAT).to_string().into())],
            )
            .await?;
        for row in &deleted {
            for eid in row.iter().filter_map(Value::as_i64) {
                session
                    .execute("DELETE FROM file WHERE eid = :eid", vec![(":eid", eid.into())])
                    .await?;
            }
        }
        if !deleted.is_empty() {
            tracing::info!(count = deleted.len(), "expired searches deleted");
        }
        Ok(deleted.len())
    }

    /// Logins owning at least one search.
    pub async fn owners(&self, session: &dyn StoreSession) -> Result<Vec<String>, SearchError> {
        let rows = session
            .execute(
                "SELECT DISTINCT u.login FROM search s JOIN cw_user u ON u.eid = s.owner ORDER BY u.login",
                vec![],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_str).map(str::to_owned))
            .collect())
    }
}

async fn insert_file(
    session: &dyn StoreSession,
    name: &str,
    format: &str,
    data: Vec<u8>,
) -> Result<i64, SearchError> {
    let rows = session
        .execute(
            "INSERT INTO file (owner, data_name, data_format, data) \
             VALUES (:owner, :name, :format, :data) RETURNING eid",
            vec![
                (":owner", session.user_eid().into()),
                (":name", name.into()),
                (":format", format.into()),
                (":data", data.into()),
            ],
        )
        .await?;
    first_i64(&rows)
}

fn first_i64(rows: &[Row]) -> Result<i64, SearchError> {
    rows.first()
        .and_then(|r| r.first())
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::Decode("expected an eid".into()).into())
}

/// Distinct non-null values of the leading `columns` columns, in first
/// appearance order.
pub fn collect_files(rows: &[Row], columns: usize) -> Vec<String> {
    let mut files = IndexSet::new();
    for row in rows {
        for value in row.iter().take(columns) {
            if !value.is_null() {
                files.insert(value.to_text());
            }
        }
    }
    files.into_iter().collect()
}

/// Serialize rows in `format`.
pub fn export_rows(format: ExportFormat, rows: &[Row]) -> Result<Vec<u8>, SearchError> {
    match format {
        ExportFormat::Json => {
            let table: Vec<Vec<serde_json::Value>> = rows
                .iter()
                .map(|row| row.iter().map(Value::to_json).collect())
                .collect();
            serde_json::to_vec(&table).map_err(|e| SearchError::Export(e.to_string()))
        }
        ExportFormat::Csv => {
            let mut out = String::new();
            for row in rows {
                let fields: Vec<String> = row.iter().map(|v| csv_field(&v.to_text())).collect();
                out.push_str(&fields.join(","));
                out.push_str("\r\n");
            }
            Ok(out.into_bytes())
        }
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_owned()
    }
}
