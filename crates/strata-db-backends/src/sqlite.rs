//! SQLite connections using `rusqlite`.
//!
//! This module provides [`SqliteFactory`] and [`SqliteConnection`], which
//! implement the engine's connection traits using `rusqlite` wrapped in
//! `tokio::task::spawn_blocking` for async compatibility.
//!
//! Features:
//! - WAL mode and foreign keys enabled on every opened database
//! - `lower()` replaced by a Unicode-aware version, since the built-in one
//!   folds only ASCII letters
//! - In-memory databases via the `:memory:` path; all connections of a factory
//!   share the one in-memory database
//! - Dropping an in-flight `execute` future interrupts the running statement

use std::path::PathBuf;
use std::sync::Arc;

use strata_core::{StrataError, StrataResult};
use strata_db::connection::{Connection, ConnectionFactory, RowSet};
use strata_db::dialect::DatabaseBackendType;
use strata_db::value::Value;
use tokio::sync::Mutex;

const MEMORY: &str = ":memory:";

fn open_database(path: &PathBuf) -> StrataResult<rusqlite::Connection> {
    let conn = if path.to_str() == Some(MEMORY) {
        rusqlite::Connection::open_in_memory()
    } else {
        rusqlite::Connection::open(path)
    }
    .map_err(|e| StrataError::ConnectionError(format!("SQLite open failed: {e}")))?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .map_err(|e| StrataError::ConnectionError(format!("Failed to set pragmas: {e}")))?;
    register_unicode_lower(&conn)?;
    Ok(conn)
}

fn register_unicode_lower(conn: &rusqlite::Connection) -> StrataResult<()> {
    use rusqlite::functions::FunctionFlags;
    use rusqlite::types::{Value as SqlValue, ValueRef};

    conn.create_scalar_function(
        "lower",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            Ok(match ctx.get_raw(0) {
                ValueRef::Null => SqlValue::Null,
                ValueRef::Text(b) => SqlValue::Text(String::from_utf8_lossy(b).to_lowercase()),
                ValueRef::Integer(v) => SqlValue::Text(v.to_string()),
                ValueRef::Real(v) => SqlValue::Text(v.to_string()),
                ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
            })
        },
    )
    .map_err(|e| StrataError::ConnectionError(format!("Failed to register lower(): {e}")))
}

/// Opens connections to one SQLite database.
///
/// A file database gets a fresh `rusqlite` connection per `connect()`. An
/// in-memory database exists only as long as its connection, so the factory
/// opens it once and every `connect()` shares it.
pub struct SqliteFactory {
    alias: String,
    path: PathBuf,
    shared: Option<Arc<Mutex<rusqlite::Connection>>>,
}

impl SqliteFactory {
    /// Creates a factory for the database at `path` (or `:memory:`).
    ///
    /// # Errors
    ///
    /// Returns an error if an in-memory database cannot be created. File
    /// databases are opened on `connect()`.
    pub fn open(alias: impl Into<String>, path: impl Into<PathBuf>) -> StrataResult<Self> {
        let path = path.into();
        let shared = if path.to_str() == Some(MEMORY) {
            Some(Arc::new(Mutex::new(open_database(&path)?)))
        } else {
            None
        };
        Ok(Self {
            alias: alias.into(),
            path,
            shared,
        })
    }

    /// Creates a factory for a private in-memory database.
    pub fn memory(alias: impl Into<String>) -> StrataResult<Self> {
        Self::open(alias, MEMORY)
    }

    /// Returns a connection to the factory's in-memory database without
    /// awaiting.
    ///
    /// # Errors
    ///
    /// Returns a connection error for file databases, which are opened by
    /// `connect()`.
    pub fn memory_connection(&self) -> StrataResult<Arc<dyn Connection>> {
        let shared = self.shared.as_ref().ok_or_else(|| {
            StrataError::ConnectionError(format!("{}: not an in-memory database", self.alias))
        })?;
        Ok(Arc::new(SqliteConnection {
            alias: self.alias.clone(),
            conn: Arc::clone(shared),
        }))
    }

    /// Returns the database file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl std::fmt::Debug for SqliteFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFactory")
            .field("alias", &self.alias)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for SqliteFactory {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> StrataResult<Arc<dyn Connection>> {
        let conn = match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => {
                let path = self.path.clone();
                let opened = tokio::task::spawn_blocking(move || open_database(&path))
                    .await
                    .map_err(|e| StrataError::ConnectionError(format!("Task join error: {e}")))??;
                Arc::new(Mutex::new(opened))
            }
        };
        Ok(Arc::new(SqliteConnection {
            alias: self.alias.clone(),
            conn,
        }))
    }
}

/// A SQLite connection.
///
/// Statements run on the blocking thread pool while holding the
/// connection's mutex, so statements on one database never interleave.
pub struct SqliteConnection {
    alias: String,
    conn: Arc<Mutex<rusqlite::Connection>>,
}

/// Interrupts the running statement when dropped, unless disarmed.
struct InterruptOnDrop(Option<rusqlite::InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            tracing::debug!("interrupting cancelled SQLite statement");
            handle.interrupt();
        }
    }
}

impl SqliteConnection {
    /// Binds engine `Value`s to a `rusqlite` statement.
    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> StrataResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string().as_str()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string().as_str()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string().as_str()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string().as_str()),
                Value::List(_) => {
                    return Err(StrataError::DatabaseError(format!(
                        "Bind error: parameter {idx} is a list"
                    )));
                }
            }
            .map_err(|e| StrataError::DatabaseError(format!("Bind error: {e}")))?;
        }
        Ok(())
    }

    /// Converts a `rusqlite::Row` to engine values.
    fn convert_row(sqlite_row: &rusqlite::Row<'_>, width: usize) -> Vec<Value> {
        (0..width)
            .map(|i| {
                match sqlite_row.get_ref(i).unwrap_or(rusqlite::types::ValueRef::Null) {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(v) => Value::Int(v),
                    rusqlite::types::ValueRef::Real(v) => Value::Float(v),
                    rusqlite::types::ValueRef::Text(b) => {
                        Value::String(String::from_utf8_lossy(b).to_string())
                    }
                    rusqlite::types::ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
                }
            })
            .collect()
    }

    fn run(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> StrataResult<RowSet> {
        let db_error = |e: rusqlite::Error| StrataError::DatabaseError(format!("{e}"));
        let mut stmt = conn.prepare(sql).map_err(db_error)?;
        Self::bind_params(&mut stmt, params)?;

        let is_insert = sql
            .trim_start()
            .get(..6)
            .is_some_and(|keyword| keyword.eq_ignore_ascii_case("insert"));
        let last_insert_id = || is_insert.then(|| conn.last_insert_rowid());

        if stmt.column_count() == 0 {
            let count = stmt.raw_execute().map_err(db_error)?;
            return Ok(RowSet::affected(
                u64::try_from(count).unwrap_or(u64::MAX),
                last_insert_id(),
            ));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let readonly = stmt.readonly();
        let mut values = Vec::new();
        let mut raw_rows = stmt.raw_query();
        while let Some(row) = raw_rows.next().map_err(db_error)? {
            values.push(Self::convert_row(row, width));
        }
        drop(raw_rows);

        let mut set = RowSet::from_rows(columns, values);
        if !readonly {
            set.rows_affected = conn.changes();
        }
        set.last_insert_id = last_insert_id();
        Ok(set)
    }
}

#[async_trait::async_trait]
impl Connection for SqliteConnection {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> StrataResult<RowSet> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let interrupt = InterruptOnDrop(Some(guard.get_interrupt_handle()));
        let sql = sql.to_string();
        let params = params.to_vec();

        let result = tokio::task::spawn_blocking(move || Self::run(&guard, &sql, &params))
            .await
            .map_err(|e| StrataError::DatabaseError(format!("Task join error: {e}")))?;
        interrupt.disarm();
        result
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}
