//! The connection provider interface.
//!
//! The engine never opens sockets or files itself. It asks a
//! [`ConnectionFactory`] for a [`Connection`], runs one statement on it and
//! hands it back. Backends implement both traits; the router holds one
//! factory for the primary and one per replica.

use std::sync::Arc;

use strata_core::StrataResult;

use crate::dialect::DatabaseBackendType;
use crate::row::Row;
use crate::value::Value;

/// The outcome of one statement.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    /// Column names of the returned rows.
    pub columns: Arc<[String]>,
    /// Returned rows; empty for statements that return none.
    pub rows: Vec<Row>,
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// The auto-generated key of the last inserted row, when the store reports one.
    pub last_insert_id: Option<i64>,
}

impl RowSet {
    /// Builds a row set from column names and row values.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let columns: Arc<[String]> = Arc::from(columns);
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&columns), values))
            .collect();
        Self {
            columns,
            rows_affected: 0,
            rows,
            last_insert_id: None,
        }
    }

    /// Builds the row set of a statement that returned no rows.
    pub fn affected(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows_affected,
            last_insert_id,
            ..Self::default()
        }
    }

    /// Returns the first cell of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.values().first())
    }
}

/// A live connection to one database.
///
/// Implementations must be safe to share, but the engine never runs two
/// statements on the same connection concurrently.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// The settings alias this connection was opened for.
    fn alias(&self) -> &str;

    /// The backend type, which selects the SQL dialect.
    fn backend(&self) -> DatabaseBackendType;

    /// Executes a statement with bound parameters.
    ///
    /// Dropping the returned future before it completes must stop the
    /// in-flight statement.
    async fn execute(&self, sql: &str, params: &[Value]) -> StrataResult<RowSet>;

    /// Returns the connection to its pool or closes it.
    async fn close(&self) -> StrataResult<()> {
        Ok(())
    }
}

/// Opens connections to one configured database.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// The settings alias of the database.
    fn alias(&self) -> &str;

    /// Opens (or checks out) a connection.
    async fn connect(&self) -> StrataResult<Arc<dyn Connection>>;
}
