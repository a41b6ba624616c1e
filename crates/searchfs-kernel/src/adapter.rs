//! Result-set adapters.
//!
//! An adapter rewrites a raw search query so that its leading projected
//! columns are file paths. Adapters are registered per entity type once at
//! startup and looked up by table name when a search is created.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::ExportFormat;
use crate::search::SearchError;

/// Output of [`ResultSetAdapter::rewrite`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    /// Query with the file columns projected first.
    pub query: String,
    /// How many leading columns are file paths.
    pub file_columns: usize,
}

/// Rewrites a query to surface file paths for one entity binding.
pub trait ResultSetAdapter: Send + Sync {
    /// Rewrite `query` for the entity bound to `label`.
    ///
    /// `suffix` keeps injected identifiers unique when several adapters
    /// apply to the same query. A collision between the query's own tokens
    /// and an injected identifier is a validation error.
    fn rewrite(&self, query: &str, label: &str, suffix: usize) -> Result<Rewrite, SearchError>;

    /// How searches using this adapter serialize their result.
    fn export_format(&self) -> ExportFormat;
}

/// Projects the paths of the file sets attached to an entity.
///
/// ```text
/// SELECT S.eid FROM scan S WHERE S.label = 'T1'
/// -> SELECT FENTRIES1.filepath AS PATH1, S.eid FROM scan S
///    JOIN file_set FILES1 ON FILES1.entity_eid = S.eid
///    JOIN file_entry FENTRIES1 ON FENTRIES1.fileset_eid = FILES1.eid
///    WHERE S.label = 'T1'
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSetAdapter;

impl ResultSetAdapter for FileSetAdapter {
    fn rewrite(&self, query: &str, label: &str, suffix: usize) -> Result<Rewrite, SearchError> {
        let path = format!("PATH{suffix}");
        let files = format!("FILES{suffix}");
        let entries = format!("FENTRIES{suffix}");
        check_reserved(query, &[&path, &files, &entries])?;

        let query = query.trim().trim_end_matches(';').trim_end();
        let (select_end, rest_start) = select_prefix(query).ok_or_else(|| {
            SearchError::Validation(format!("expected a SELECT query: {query}"))
        })?;

        let projection = format!("{entries}.filepath AS {path}, ");
        let joins = format!(
            " JOIN file_set {files} ON {files}.entity_eid = {label}.eid \
             JOIN file_entry {entries} ON {entries}.fileset_eid = {files}.eid"
        );

        let body = &query[rest_start..];
        let insert_at = top_level_clause(body).unwrap_or(body.len());
        let (head, tail) = body.split_at(insert_at);

        let mut out = String::with_capacity(query.len() + projection.len() + joins.len() + 1);
        out.push_str(&query[..select_end]);
        out.push(' ');
        out.push_str(&projection);
        out.push_str(head.trim_end());
        out.push_str(&joins);
        if !tail.is_empty() {
            out.push(' ');
            out.push_str(tail);
        }
        Ok(Rewrite {
            query: out,
            file_columns: 1,
        })
    }

    fn export_format(&self) -> ExportFormat {
        ExportFormat::Json
    }
}

/// Exports the entities themselves; exposes no files.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityAdapter;

impl ResultSetAdapter for EntityAdapter {
    fn rewrite(&self, query: &str, _label: &str, _suffix: usize) -> Result<Rewrite, SearchError> {
        Ok(Rewrite {
            query: query.to_owned(),
            file_columns: 1,
        })
    }

    fn export_format(&self) -> ExportFormat {
        ExportFormat::Csv
    }
}

/// Entity-type tag -> adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ResultSetAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.adapters.keys().collect();
        tags.sort();
        f.debug_struct("AdapterRegistry").field("tags", &tags).finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapters for the bundled sample schema.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("scan", Arc::new(FileSetAdapter));
        registry.register("subject", Arc::new(EntityAdapter));
        registry
    }

    /// Register (or replace) the adapter for `tag`. Tags are case-insensitive.
    pub fn register(&mut self, tag: &str, adapter: Arc<dyn ResultSetAdapter>) {
        self.adapters.insert(tag.to_ascii_lowercase(), adapter);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn ResultSetAdapter>> {
        self.adapters.get(&tag.to_ascii_lowercase()).cloned()
    }
}

/// Identifier tokens of a query, outside string literals.
pub(crate) fn tokens(query: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = None;
    let mut quote: Option<char> = None;
    for (i, c) in query.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        let ident = c.is_ascii_alphanumeric() || c == '_';
        match (ident, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                out.push(&query[s..i]);
                start = None;
            }
            _ => {}
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
        }
    }
    if let Some(s) = start {
        out.push(&query[s..]);
    }
    out
}

fn check_reserved(query: &str, reserved: &[&str]) -> Result<(), SearchError> {
    for token in tokens(query) {
        if let Some(hit) = reserved.iter().find(|r| r.eq_ignore_ascii_case(token)) {
            return Err(SearchError::Validation(format!(
                "'{hit}' is a reserved identifier, rename it in your query"
            )));
        }
    }
    Ok(())
}

/// Byte range of `SELECT [DISTINCT]`: returns (end of keyword(s), start of
/// the projection).
fn select_prefix(query: &str) -> Option<(usize, usize)> {
    let head = query.get(..6)?;
    if !head.eq_ignore_ascii_case("select") {
        return None;
    }
    let after = &query[6..];
    if !after.starts_with(char::is_whitespace) {
        return None;
    }
    let trimmed = after.trim_start();
    let mut end = query.len() - trimmed.len();
    let mut kw_end = 6;
    if let (Some(word), Some(rest)) = (trimmed.get(..8), trimmed.get(8..)) {
        if word.eq_ignore_ascii_case("distinct") && rest.starts_with(char::is_whitespace) {
            kw_end = end + 8;
            end = query.len() - rest.trim_start().len();
        }
    }
    Some((kw_end, end))
}

/// Offset of the first top-level WHERE / GROUP / HAVING / ORDER / LIMIT.
fn top_level_clause(body: &str) -> Option<usize> {
    const CLAUSES: [&str; 5] = ["WHERE", "GROUP", "HAVING", "ORDER", "LIMIT"];
    let bytes = body.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' => quote = Some(c),
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 && c.is_ascii_alphabetic() => {
                let boundary = i == 0 || !(bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
                let end = body[i..]
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .map_or(body.len(), |n| i + n);
                if boundary && CLAUSES.iter().any(|k| k.eq_ignore_ascii_case(&body[i..end])) {
                    return Some(i);
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_set_rewrite_with_where() {
        let rw = FileSetAdapter
            .rewrite("SELECT S.eid FROM scan S WHERE S.label = 'T1'", "S", 1)
            .unwrap();
        assert_eq!(rw.file_columns, 1);
        assert_eq!(
            rw.query,
            "SELECT FENTRIES1.filepath AS PATH1, S.eid FROM scan S \
             JOIN file_set FILES1 ON FILES1.entity_eid = S.eid \
             JOIN file_entry FENTRIES1 ON FENTRIES1.fileset_eid = FILES1.eid \
             WHERE S.label = 'T1'"
        );
    }

    #[test]
    fn test_file_set_rewrite_without_clause() {
        let rw = FileSetAdapter
            .rewrite("select distinct S.label from scan AS S;", "S", 2)
            .unwrap();
        assert!(rw.query.starts_with("select distinct FENTRIES2.filepath AS PATH2, S.label from scan AS S JOIN file_set FILES2"));
        assert!(rw.query.ends_with("FENTRIES2.fileset_eid = FILES2.eid"));
    }

    #[test]
    fn test_clause_inside_subquery_is_ignored() {
        let q = "SELECT S.eid FROM scan S JOIN (SELECT eid FROM subject WHERE eid > 1) X ON X.eid = S.subject ORDER BY S.eid";
        let rw = FileSetAdapter.rewrite(q, "S", 1).unwrap();
        let join_at = rw.query.find("JOIN file_set").unwrap();
        let order_at = rw.query.find("ORDER BY").unwrap();
        assert!(rw.query.contains("WHERE eid > 1) X ON X.eid = S.subject JOIN file_set"));
        assert!(join_at < order_at);
    }

    #[test]
    fn test_reserved_identifier_collision() {
        let err = FileSetAdapter
            .rewrite("SELECT path1.eid FROM scan path1", "path1", 1)
            .unwrap_err();
        assert!(matches!(err, SearchError::Validation(_)));

        // Quoted text is not an identifier.
        assert!(FileSetAdapter
            .rewrite("SELECT S.eid FROM scan S WHERE S.label = 'FILES1'", "S", 1)
            .is_ok());
        // Suffix makes the identifiers distinct.
        assert!(FileSetAdapter
            .rewrite("SELECT PATH1.eid FROM scan PATH1", "PATH1", 2)
            .is_ok());
    }

    #[test]
    fn test_rejects_non_select() {
        assert!(FileSetAdapter.rewrite("DELETE FROM scan", "scan", 1).is_err());
    }

    #[test]
    fn test_entity_adapter_is_identity() {
        let q = "SELECT S.identifier FROM subject S";
        let rw = EntityAdapter.rewrite(q, "S", 1).unwrap();
        assert_eq!(rw.query, q);
        assert_eq!(EntityAdapter.export_format(), ExportFormat::Csv);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AdapterRegistry::with_defaults();
        assert!(registry.get("SCAN").is_some());
        assert!(registry.get("file").is_none());
        assert_eq!(registry.get("scan").unwrap().export_format(), ExportFormat::Json);
    }

    #[test]
    fn test_tokens() {
        assert_eq!(
            tokens("SELECT a.b FROM t WHERE x = 'no such'"),
            vec!["SELECT", "a", "b", "FROM", "t", "WHERE", "x"]
        );
    }
}
