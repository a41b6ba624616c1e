//! Backing-store abstraction.
//!
//! A [`Repository`] is one backing instance; it hands out authenticated
//! [`StoreSession`]s that execute parametrized queries and return rows.
//! Only the search registry and the search/housekeeping services issue
//! queries.

pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::vfs::VfsError;

pub use sqlite::SqliteRepository;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad login or password.
    #[error("authentication failed for {0}")]
    AuthenticationFailed(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking task panicked or was cancelled.
    #[error("store task: {0}")]
    Task(String),

    /// A stored value had an unexpected shape.
    #[error("decode: {0}")]
    Decode(String),

    /// Session closed or instance unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for VfsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AuthenticationFailed(login) => VfsError::permission_denied(login),
            other => VfsError::backing_unavailable(other.to_string()),
        }
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// JSON rendering used by result exports.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => (*i).into(),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => s.clone().into(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned().into(),
        }
    }

    /// Plain text rendering used by CSV exports.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// Named query parameters, e.g. `(":login", "alice".into())`.
pub type Params = Vec<(&'static str, Value)>;

/// An authenticated connection to one backing instance.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Login this session acts for.
    fn login(&self) -> &str;

    /// Numeric identifier of the session user.
    fn user_eid(&self) -> i64;

    /// Execute a parametrized query and collect its rows.
    async fn execute(&self, query: &str, params: Params) -> StoreResult<Vec<Row>>;

    /// Release the session. Later queries fail with `Unavailable`.
    async fn close(&self);
}

/// One backing instance.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Identifier of this instance (the database path for SQLite).
    fn instance_name(&self) -> &str;

    /// Check credentials and open a session.
    async fn connect(&self, login: &str, password: &str) -> StoreResult<Arc<dyn StoreSession>>;

    /// Open a session for a known login without a password.
    ///
    /// Only for processes already trusted by the host, such as the FUSE
    /// daemon spawned for that user.
    async fn session_for(&self, login: &str) -> StoreResult<Arc<dyn StoreSession>>;

    /// Privileged maintenance session.
    async fn internal_session(&self) -> StoreResult<Arc<dyn StoreSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let e: VfsError = StoreError::AuthenticationFailed("bob".into()).into();
        assert!(matches!(e, VfsError::PermissionDenied(_)));
        let e: VfsError = StoreError::Unavailable("closed".into()).into();
        assert!(e.is_transient());
    }

    #[test]
    fn test_value_renderings() {
        assert_eq!(Value::from(3).to_json(), serde_json::json!(3));
        assert_eq!(Value::Null.to_text(), "");
        assert_eq!(Value::from("a").as_str(), Some("a"));
        assert_eq!(Value::Real(f64::NAN).to_json(), serde_json::Value::Null);
    }
}
