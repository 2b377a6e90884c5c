//! Test database utilities for strata.
//!
//! Provides [`TestDatabase`], an in-memory SQLite database for use in tests.
//! It implements [`ConnectionFactory`] so it can serve as the primary (or a
//! replica) of a router, and adds helpers for creating tables from model
//! descriptors and for counting the statements executed against it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use strata_test::test_database::TestDatabase;
//!
//! async fn example() {
//!     let db = TestDatabase::new();
//!     db.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
//!         .await
//!         .unwrap();
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use strata_core::StrataResult;
use strata_db::connection::{Connection, ConnectionFactory, RowSet};
use strata_db::dialect::DatabaseBackendType;
use strata_db::model::{ModelDescriptor, SemanticType};
use strata_db::router::ConnectionRouter;
use strata_db::value::Value;
use strata_db_backends::SqliteFactory;

/// An in-memory SQLite database for testing.
///
/// Every connection handed out by [`connect`](ConnectionFactory::connect)
/// shares the one database and bumps the shared statement counter used by
/// [`assert_num_queries`](crate::assert_num_queries).
///
/// Clones share the database and the counter.
#[derive(Clone)]
pub struct TestDatabase {
    alias: String,
    connection: Arc<dyn Connection>,
    query_count: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl TestDatabase {
    /// Creates a new in-memory SQLite test database under the alias `default`.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory database cannot be created.
    pub fn new() -> Self {
        Self::with_alias("default")
    }

    /// Creates a new in-memory SQLite test database under `alias`.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory database cannot be created.
    pub fn with_alias(alias: &str) -> Self {
        Self::try_new(alias).expect("Failed to create in-memory SQLite database")
    }

    /// Creates a new in-memory SQLite test database, returning any error.
    pub fn try_new(alias: &str) -> StrataResult<Self> {
        let query_count = Arc::new(AtomicUsize::new(0));
        let statements = Arc::new(Mutex::new(Vec::new()));
        let connection: Arc<dyn Connection> = Arc::new(CountingConnection {
            inner: SqliteFactory::memory(alias)?.memory_connection()?,
            query_count: Arc::clone(&query_count),
            statements: Arc::clone(&statements),
        });
        Ok(Self {
            alias: alias.to_string(),
            connection,
            query_count,
            statements,
        })
    }

    /// Creates the table of a model descriptor.
    ///
    /// Generates a `CREATE TABLE` statement from the descriptor's columns and
    /// executes it against the test database.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL execution fails.
    pub async fn setup_table(&self, descriptor: &ModelDescriptor) -> StrataResult<()> {
        let sql = Self::create_table_sql(descriptor);
        self.execute_raw(&sql).await?;
        Ok(())
    }

    /// Drops all user-created tables in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL execution fails.
    pub async fn teardown(&self) -> StrataResult<()> {
        let set = self
            .connection
            .execute(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                &[],
            )
            .await?;

        for row in &set.rows {
            let table_name: String = row.get("name")?;
            self.connection
                .execute(&format!("DROP TABLE IF EXISTS \"{table_name}\""), &[])
                .await?;
        }
        Ok(())
    }

    /// Executes a raw SQL string with no parameters.
    ///
    /// Increments the query counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL execution fails.
    pub async fn execute_raw(&self, sql: &str) -> StrataResult<RowSet> {
        self.connection.execute(sql, &[]).await
    }

    /// Executes a statement with parameters. Increments the query counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL execution fails.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> StrataResult<RowSet> {
        self.connection.execute(sql, params).await
    }

    /// Returns a connection to the database, for `QuerySet::using`.
    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection)
    }

    /// Returns a router whose primary is this database and which has no
    /// replicas.
    pub fn router(&self) -> Arc<ConnectionRouter> {
        Arc::new(ConnectionRouter::new(Arc::new(self.clone())))
    }

    /// Returns the current query count.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Resets the query counter and the statement log.
    pub fn reset_query_count(&self) {
        self.query_count.store(0, Ordering::Relaxed);
        if let Ok(mut statements) = self.statements.lock() {
            statements.clear();
        }
    }

    /// Returns the SQL of every statement since the last reset.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .map(|statements| statements.clone())
            .unwrap_or_default()
    }

    /// Generates a `CREATE TABLE IF NOT EXISTS` SQL statement from a descriptor.
    fn create_table_sql(descriptor: &ModelDescriptor) -> String {
        let table_name = descriptor.table_name();
        let col_defs: Vec<String> = descriptor
            .columns()
            .iter()
            .map(|column| {
                let type_str = match column.semantic_type {
                    SemanticType::Integer | SemanticType::Boolean => "INTEGER",
                    SemanticType::Float => "REAL",
                    SemanticType::Bytes => "BLOB",
                    // Dates, UUIDs and JSON are stored as text in SQLite.
                    SemanticType::Text
                    | SemanticType::Date
                    | SemanticType::DateTime
                    | SemanticType::Uuid
                    | SemanticType::Json => "TEXT",
                };

                let mut parts = vec![format!("\"{}\" {type_str}", column.name)];
                if column.primary_key {
                    parts.push("PRIMARY KEY".to_string());
                    if column.semantic_type == SemanticType::Integer {
                        parts.push("AUTOINCREMENT".to_string());
                    }
                } else if !column.nullable {
                    parts.push("NOT NULL".to_string());
                }
                parts.join(" ")
            })
            .collect();

        let body = col_defs.join(", ");
        format!("CREATE TABLE IF NOT EXISTS \"{table_name}\" ({body})")
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDatabase")
            .field("alias", &self.alias)
            .field("query_count", &self.query_count())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for TestDatabase {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> StrataResult<Arc<dyn Connection>> {
        tracing::trace!(alias = %self.alias, "test database connect");
        Ok(self.connection())
    }
}

/// A connection that counts and records the statements it executes.
struct CountingConnection {
    inner: Arc<dyn Connection>,
    query_count: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Connection for CountingConnection {
    fn alias(&self) -> &str {
        self.inner.alias()
    }

    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> StrataResult<RowSet> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut statements) = self.statements.lock() {
            statements.push(sql.to_string());
        }
        self.inner.execute(sql, params).await
    }
}
