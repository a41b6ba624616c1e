//! Search-side data model: file lists, blob references, report blobs.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Basename of a search's own serialized result.
pub const OWN_RESULT_BASENAME: &str = "rset";

/// Name under which the report blob is stored.
pub const REPORT_BLOB_NAME: &str = "result.json";

/// One entry of a search's flattened file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFile {
    /// Absolute real path (or synthetic path for blobs).
    pub path: String,
    /// True when the bytes live in the backing store.
    pub is_blob: bool,
}

impl SearchFile {
    /// A filesystem-backed file.
    pub fn real(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_blob: false,
        }
    }

    /// A store-backed file.
    pub fn blob(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_blob: true,
        }
    }
}

/// A store-backed leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlobRef {
    /// The owning search's serialized result.
    OwnResult,
    /// Any file attachment, by numeric identifier.
    Attachment(i64),
}

/// Serialization format of a search's own result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum ExportFormat {
    /// JSON array of rows.
    #[strum(serialize = "jsonexport")]
    #[serde(rename = "jsonexport")]
    Json,
    /// Comma separated rows. Searches exported this way expose no files.
    #[strum(serialize = "ecsvexport")]
    #[serde(rename = "ecsvexport")]
    Csv,
}

impl ExportFormat {
    /// File extension of the own-result leaf.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    /// MIME type stored alongside the blob.
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }

    /// Whether the search's file columns are collected.
    pub fn collects_files(&self) -> bool {
        !matches!(self, ExportFormat::Csv)
    }

    /// Basename of the own-result leaf, e.g. `rset.json`.
    pub fn own_result_name(&self) -> String {
        format!("{}.{}", OWN_RESULT_BASENAME, self.extension())
    }

    /// Parse a stored `rset_type`, falling back to JSON for unknown values.
    pub fn from_stored(value: &str) -> Self {
        value.parse().unwrap_or(ExportFormat::Json)
    }
}

/// On-disk JSON shape of a search's report blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchReport {
    /// The (rewritten) query that produced the files.
    pub rql: String,
    /// Files referenced by the search.
    pub files: Vec<String>,
    /// Files known to be missing at creation time.
    #[serde(rename = "nonexistent-files", default)]
    pub nonexistent_files: Vec<String>,
    /// Number of leading file columns in the query result.
    #[serde(default)]
    pub upper_file_index: usize,
}

impl SearchReport {
    /// Decode a report blob.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Encode this report.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_format_names() {
        assert_eq!(ExportFormat::Json.to_string(), "jsonexport");
        assert_eq!("ecsvexport".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::from_stored("bogus"), ExportFormat::Json);
        assert_eq!(ExportFormat::Csv.own_result_name(), "rset.csv");
        assert!(!ExportFormat::Csv.collects_files());
    }

    #[test]
    fn test_report_shape() {
        let raw = br#"{"rql": "SELECT 1", "files": ["/a", "/b"], "nonexistent-files": []}"#;
        let report = SearchReport::from_slice(raw).unwrap();
        assert_eq!(report.files, vec!["/a", "/b"]);
        assert_eq!(report.upper_file_index, 0);

        let encoded = String::from_utf8(report.to_vec().unwrap()).unwrap();
        assert!(encoded.contains("\"nonexistent-files\""));
    }
}
