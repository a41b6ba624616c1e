//! SQLite backing store.
//!
//! One database file is one backing instance. The connection is shared by
//! every session of the instance behind a mutex; all calls run on the
//! blocking pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSql, Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{Params, Repository, Row, StoreError, StoreResult, StoreSession, Value};

const SCHEMA: &str = r#"
-- Accounts
CREATE TABLE IF NOT EXISTS cw_user (
    eid INTEGER PRIMARY KEY,
    login TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL
);

-- Stored payloads (search results, reports, attachments)
CREATE TABLE IF NOT EXISTS file (
    eid INTEGER PRIMARY KEY,
    owner INTEGER NOT NULL REFERENCES cw_user(eid),
    data_name TEXT NOT NULL,
    data_format TEXT NOT NULL,
    data BLOB NOT NULL
);

-- Saved searches
CREATE TABLE IF NOT EXISTS search (
    eid INTEGER PRIMARY KEY,
    owner INTEGER NOT NULL REFERENCES cw_user(eid),
    title TEXT NOT NULL,
    query TEXT NOT NULL,
    expiration_date TEXT NOT NULL,
    rset_type TEXT NOT NULL DEFAULT 'jsonexport',
    result_file INTEGER REFERENCES file(eid),
    rset_file INTEGER REFERENCES file(eid),
    UNIQUE (owner, title)
);
CREATE INDEX IF NOT EXISTS idx_search_expiration ON search(expiration_date);

-- Sample domain entities
CREATE TABLE IF NOT EXISTS subject (
    eid INTEGER PRIMARY KEY,
    identifier TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS scan (
    eid INTEGER PRIMARY KEY,
    subject INTEGER REFERENCES subject(eid),
    label TEXT NOT NULL
);

-- File sets attached to domain entities
CREATE TABLE IF NOT EXISTS file_set (
    eid INTEGER PRIMARY KEY,
    entity_eid INTEGER NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS file_entry (
    eid INTEGER PRIMARY KEY,
    fileset_eid INTEGER NOT NULL REFERENCES file_set(eid),
    filepath TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_set_entity ON file_set(entity_eid);
CREATE INDEX IF NOT EXISTS idx_file_entry_set ON file_entry(fileset_eid);
"#;

/// Login of the privileged maintenance session.
pub const INTERNAL_LOGIN: &str = "internal";

/// SQLite-backed instance.
pub struct SqliteRepository {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository")
            .field("name", &self.name)
            .finish()
    }
}

impl SqliteRepository {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::init(conn, path.display().to_string())
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_owned())
    }

    fn init(conn: Connection, name: String) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            name,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an account. Returns its eid.
    pub fn create_user(&self, login: &str, password: &str) -> StoreResult<i64> {
        let hash = hash_password(password, &new_salt());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cw_user (login, password_hash) VALUES (?1, ?2)",
            params![login, hash],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attach a file set with the given paths to a domain entity.
    pub fn add_file_set(&self, entity_eid: i64, name: &str, paths: &[&str]) -> StoreResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO file_set (entity_eid, name) VALUES (?1, ?2)",
            params![entity_eid, name],
        )?;
        let set_eid = tx.last_insert_rowid();
        for path in paths {
            tx.execute(
                "INSERT INTO file_entry (fileset_eid, filepath) VALUES (?1, ?2)",
                params![set_eid, path],
            )?;
        }
        tx.commit()?;
        Ok(set_eid)
    }

    fn session(&self, login: &str, user_eid: i64) -> Arc<dyn StoreSession> {
        Arc::new(SqliteSession {
            login: login.to_owned(),
            user_eid,
            conn: self.conn.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn lookup_user(&self, login: &str) -> StoreResult<Option<(i64, String)>> {
        let login = login.to_owned();
        run_blocking(self.conn.clone(), move |conn| {
            Ok(conn
                .query_row(
                    "SELECT eid, password_hash FROM cw_user WHERE login = ?1",
                    params![login],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })
        .await
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, login: &str, password: &str) -> StoreResult<Arc<dyn StoreSession>> {
        match self.lookup_user(login).await? {
            Some((eid, stored)) if verify_password(password, &stored) => {
                tracing::debug!(instance = %self.name, login, "store login");
                Ok(self.session(login, eid))
            }
            _ => Err(StoreError::AuthenticationFailed(login.to_owned())),
        }
    }

    async fn session_for(&self, login: &str) -> StoreResult<Arc<dyn StoreSession>> {
        let (eid, _) = self
            .lookup_user(login)
            .await?
            .ok_or_else(|| StoreError::AuthenticationFailed(login.to_owned()))?;
        Ok(self.session(login, eid))
    }

    async fn internal_session(&self) -> StoreResult<Arc<dyn StoreSession>> {
        Ok(self.session(INTERNAL_LOGIN, 0))
    }
}

struct SqliteSession {
    login: String,
    user_eid: i64,
    conn: Arc<Mutex<Connection>>,
    closed: AtomicBool,
}

#[async_trait]
impl StoreSession for SqliteSession {
    fn login(&self) -> &str {
        &self.login
    }

    fn user_eid(&self) -> i64 {
        self.user_eid
    }

    async fn execute(&self, query: &str, params: Params) -> StoreResult<Vec<Row>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable(format!("session of {} closed", self.login)));
        }
        let query = query.to_owned();
        run_blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare(&query)?;
            let columns = stmt.column_count();
            let bound: Vec<(&str, SqlValue)> =
                params.into_iter().map(|(name, v)| (name, v.into())).collect();
            let refs: Vec<(&str, &dyn ToSql)> =
                bound.iter().map(|(name, v)| (*name, v as &dyn ToSql)).collect();

            let mut rows = stmt.query(refs.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(columns);
                for i in 0..columns {
                    values.push(Value::from(row.get_ref(i)?));
                }
                out.push(values);
            }
            Ok(out)
        })
        .await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock();
        f(&conn)
    })
    .await
    .map_err(|e| StoreError::Task(format!("spawn_blocking: {}", e)))?
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Integer(i),
            Value::Real(f) => SqlValue::Real(f),
            Value::Text(s) => SqlValue::Text(s),
            Value::Blob(b) => SqlValue::Blob(b),
        }
    }
}

fn new_salt() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stored hashes read `sha256$<rounds>$<salt>$<hex digest>`.
const HASH_SCHEME: &str = "sha256";
const HASH_ROUNDS: u32 = 10_000;
const MAX_HASH_ROUNDS: u32 = 1_000_000;

fn stretch(password: &str, salt: &str, rounds: u32) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..rounds {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(password.as_bytes())
            .finalize();
    }
    format!("{digest:x}")
}

fn hash_password(password: &str, salt: &str) -> String {
    let digest = stretch(password, salt, HASH_ROUNDS);
    format!("{HASH_SCHEME}${HASH_ROUNDS}${salt}${digest}")
}

fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(4, '$');
    let (Some(HASH_SCHEME), Some(rounds), Some(salt), Some(expected)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let rounds = match rounds.parse::<u32>() {
        Ok(n @ 1..=MAX_HASH_ROUNDS) => n,
        _ => return false,
    };
    let actual = stretch(password, salt, rounds);
    bool::from(actual.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash() {
        let stored = hash_password("secret", "abcd");
        assert!(stored.starts_with("sha256$10000$abcd$"));
        assert_eq!(stored.len(), "sha256$10000$abcd$".len() + 64);
        assert!(verify_password("secret", &stored));
        assert!(!verify_password("Secret", &stored));
        assert!(!verify_password("secret", "garbage"));
        assert!(!verify_password("secret", &stored[..stored.len() - 1]));
    }

    #[test]
    fn test_password_hash_rounds() {
        let stored = hash_password("secret", "abcd");
        let digest = stored.rsplit('$').next().unwrap();
        // The round count is part of what is checked.
        assert!(!verify_password("secret", &format!("sha256$9999$abcd${digest}")));
        assert!(!verify_password("secret", &format!("sha256$0$abcd${digest}")));
        assert!(!verify_password("secret", &format!("sha256$99999999$abcd${digest}")));
        assert!(!verify_password("secret", &format!("md5$10000$abcd${digest}")));
        // One round is not what gets stored.
        assert_ne!(stretch("secret", "abcd", 1), digest);
        assert_eq!(stretch("secret", "abcd", HASH_ROUNDS), digest);
    }

    #[tokio::test]
    async fn test_connect_checks_credentials() {
        let repo = SqliteRepository::in_memory().unwrap();
        let eid = repo.create_user("alice", "pw").unwrap();

        let session = repo.connect("alice", "pw").await.unwrap();
        assert_eq!(session.login(), "alice");
        assert_eq!(session.user_eid(), eid);

        assert!(matches!(
            repo.connect("alice", "nope").await.err(),
            Some(StoreError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            repo.connect("mallory", "pw").await.err(),
            Some(StoreError::AuthenticationFailed(_))
        ));
        assert!(repo.session_for("alice").await.is_ok());
        assert!(repo.session_for("mallory").await.is_err());
    }

    #[tokio::test]
    async fn test_execute_named_params() {
        let repo = SqliteRepository::in_memory().unwrap();
        repo.create_user("alice", "pw").unwrap();
        let session = repo.internal_session().await.unwrap();

        let rows = session
            .execute(
                "SELECT eid, login FROM cw_user WHERE login = :login",
                vec![(":login", "alice".into())],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1].as_str(), Some("alice"));

        let inserted = session
            .execute(
                "INSERT INTO subject (identifier) VALUES (:id) RETURNING eid",
                vec![(":id", "S1".into())],
            )
            .await
            .unwrap();
        assert!(inserted[0][0].as_i64().is_some());
    }

    #[tokio::test]
    async fn test_closed_session_is_unavailable() {
        let repo = SqliteRepository::in_memory().unwrap();
        let session = repo.internal_session().await.unwrap();
        session.close().await;
        assert!(matches!(
            session.execute("SELECT 1", vec![]).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_add_file_set() {
        let repo = SqliteRepository::in_memory().unwrap();
        let set = repo.add_file_set(42, "raw", &["/a", "/b"]).unwrap();
        let conn = repo.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM file_entry WHERE fileset_eid = ?1",
                params![set],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 2);
    }
}
