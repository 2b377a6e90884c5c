//! PostgreSQL connections using `tokio-postgres` and `deadpool-postgres`.
//!
//! [`PostgresFactory`] checks connections out of a `deadpool-postgres` pool;
//! a [`PostgresConnection`] goes back to the pool when its last handle is
//! dropped. Statements are prepared (and cached per pooled client) so that
//! parameters can be bound with the types the server inferred for them.

use std::sync::Arc;

use strata_core::settings::DatabaseSettings;
use strata_core::{StrataError, StrataResult};
use strata_db::connection::{Connection, ConnectionFactory, RowSet};
use strata_db::dialect::DatabaseBackendType;
use strata_db::query::raw::classify;
use strata_db::router::OperationKind;
use strata_db::value::Value;
use tokio_postgres::types::{ToSql, Type};

type Param = Box<dyn ToSql + Sync + Send>;

/// Checks connections out of a `deadpool-postgres` pool.
pub struct PostgresFactory {
    alias: String,
    pool: deadpool_postgres::Pool,
}

impl PostgresFactory {
    /// Creates a factory from an existing pool.
    pub fn new(alias: impl Into<String>, pool: deadpool_postgres::Pool) -> Self {
        Self {
            alias: alias.into(),
            pool,
        }
    }

    /// Creates a factory and its pool from database settings.
    ///
    /// No connection is opened until the first `connect()`. The
    /// `pool_size` option bounds the pool.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `pool_size` is not a number or the
    /// pool cannot be created.
    pub fn from_settings(alias: &str, settings: &DatabaseSettings) -> StrataResult<Self> {
        let mut pg_config = deadpool_postgres::Config::new();
        pg_config.dbname = Some(settings.name.clone());
        pg_config.host = non_empty(&settings.host);
        pg_config.port = (settings.port != 0).then_some(settings.port);
        pg_config.user = non_empty(&settings.user);
        pg_config.password = non_empty(&settings.password);

        if let Some(size) = settings.options.get("pool_size") {
            let size: usize = size.parse().map_err(|e| {
                StrataError::ConfigurationError(format!("{alias}: invalid pool_size '{size}': {e}"))
            })?;
            pg_config.pool = Some(deadpool_postgres::PoolConfig::new(size));
        }

        let pool = pg_config
            .create_pool(
                Some(deadpool_postgres::Runtime::Tokio1),
                tokio_postgres::NoTls,
            )
            .map_err(|e| {
                StrataError::ConfigurationError(format!("{alias}: failed to create pool: {e}"))
            })?;

        Ok(Self::new(alias, pool))
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl std::fmt::Debug for PostgresFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresFactory")
            .field("alias", &self.alias)
            .field("status", &self.pool.status())
            .finish()
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for PostgresFactory {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> StrataResult<Arc<dyn Connection>> {
        let client = self.pool.get().await.map_err(|e| {
            StrataError::ConnectionError(format!("{}: pool error: {e}", self.alias))
        })?;
        Ok(Arc::new(PostgresConnection {
            alias: self.alias.clone(),
            client,
        }))
    }
}

/// A pooled PostgreSQL client.
pub struct PostgresConnection {
    alias: String,
    client: deadpool_postgres::Object,
}

/// Asks the server to cancel the running statement when dropped, unless
/// disarmed.
struct CancelOnDrop(Option<tokio_postgres::CancelToken>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(token) = self.0.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tracing::debug!("cancelling PostgreSQL statement");
            handle.spawn(async move {
                if let Err(e) = token.cancel_query(tokio_postgres::NoTls).await {
                    tracing::warn!(error = %e, "failed to cancel PostgreSQL statement");
                }
            });
        }
    }
}

impl PostgresConnection {
    /// Converts a value to a parameter of the type the server expects.
    ///
    /// `tokio-postgres` checks Rust types against parameter types strictly,
    /// so integers and floats are narrowed and nulls are typed here.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn bind(value: &Value, ty: &Type) -> StrataResult<Param> {
        let out_of_range = |e: std::num::TryFromIntError| {
            StrataError::DatabaseError(format!("Bind error: {value} does not fit {ty}: {e}"))
        };
        let param: Param = match (value, ty.clone()) {
            (Value::Null, ty) => Self::null_of(&ty),
            (Value::Bool(b), _) => Box::new(*b),
            (Value::Int(i), Type::INT2) => Box::new(i16::try_from(*i).map_err(out_of_range)?),
            (Value::Int(i), Type::INT4) => Box::new(i32::try_from(*i).map_err(out_of_range)?),
            (Value::Int(i), Type::FLOAT4) => Box::new(*i as f32),
            (Value::Int(i), Type::FLOAT8) => Box::new(*i as f64),
            (Value::Int(i), Type::TEXT | Type::VARCHAR) => Box::new(i.to_string()),
            (Value::Int(i), _) => Box::new(*i),
            (Value::Float(f), Type::FLOAT4) => Box::new(*f as f32),
            (Value::Float(f), _) => Box::new(*f),
            (Value::String(s), _) => Box::new(s.clone()),
            (Value::Bytes(b), _) => Box::new(b.clone()),
            (Value::Date(d), _) => Box::new(*d),
            (Value::DateTime(dt), Type::TIMESTAMPTZ) => Box::new(dt.and_utc()),
            (Value::DateTime(dt), _) => Box::new(*dt),
            (Value::Uuid(u), _) => Box::new(*u),
            (Value::Json(j), _) => Box::new(j.clone()),
            (Value::List(_), _) => {
                return Err(StrataError::DatabaseError(format!(
                    "Bind error: a list cannot be bound to a {ty} parameter"
                )));
            }
        };
        Ok(param)
    }

    fn null_of(ty: &Type) -> Param {
        match *ty {
            Type::BOOL => Box::new(None::<bool>),
            Type::INT2 => Box::new(None::<i16>),
            Type::INT4 => Box::new(None::<i32>),
            Type::INT8 => Box::new(None::<i64>),
            Type::FLOAT4 => Box::new(None::<f32>),
            Type::FLOAT8 => Box::new(None::<f64>),
            Type::BYTEA => Box::new(None::<Vec<u8>>),
            Type::DATE => Box::new(None::<chrono::NaiveDate>),
            Type::TIMESTAMP => Box::new(None::<chrono::NaiveDateTime>),
            Type::TIMESTAMPTZ => Box::new(None::<chrono::DateTime<chrono::Utc>>),
            Type::UUID => Box::new(None::<uuid::Uuid>),
            Type::JSON | Type::JSONB => Box::new(None::<serde_json::Value>),
            _ => Box::new(None::<String>),
        }
    }

    /// Converts a `tokio_postgres::Row` to engine values.
    fn convert_row(pg_row: &tokio_postgres::Row) -> Vec<Value> {
        pg_row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| match *col.type_() {
                Type::BOOL => pg_row
                    .try_get::<_, Option<bool>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Bool),
                Type::INT2 => pg_row
                    .try_get::<_, Option<i16>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |v| Value::Int(i64::from(v))),
                Type::INT4 => pg_row
                    .try_get::<_, Option<i32>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |v| Value::Int(i64::from(v))),
                Type::INT8 => pg_row
                    .try_get::<_, Option<i64>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Int),
                Type::FLOAT4 => pg_row
                    .try_get::<_, Option<f32>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |v| Value::Float(f64::from(v))),
                Type::FLOAT8 => pg_row
                    .try_get::<_, Option<f64>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Float),
                Type::BYTEA => pg_row
                    .try_get::<_, Option<Vec<u8>>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Bytes),
                Type::UUID => pg_row
                    .try_get::<_, Option<uuid::Uuid>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Uuid),
                Type::DATE => pg_row
                    .try_get::<_, Option<chrono::NaiveDate>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Date),
                Type::TIMESTAMP => pg_row
                    .try_get::<_, Option<chrono::NaiveDateTime>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::DateTime),
                // Stored instants come back as naive UTC.
                Type::TIMESTAMPTZ => pg_row
                    .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |v| Value::DateTime(v.naive_utc())),
                Type::JSON | Type::JSONB => pg_row
                    .try_get::<_, Option<serde_json::Value>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Json),
                _ => pg_row
                    .try_get::<_, Option<String>>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::String),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Connection for PostgresConnection {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> StrataResult<RowSet> {
        let db_error = |e: tokio_postgres::Error| StrataError::DatabaseError(format!("{e}"));

        let stmt = self.client.prepare_cached(sql).await.map_err(db_error)?;
        if stmt.params().len() != params.len() {
            return Err(StrataError::DatabaseError(format!(
                "statement expects {} parameters, got {}",
                stmt.params().len(),
                params.len()
            )));
        }
        let bound = params
            .iter()
            .zip(stmt.params())
            .map(|(value, ty)| Self::bind(value, ty))
            .collect::<StrataResult<Vec<Param>>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let cancel = CancelOnDrop(Some(self.client.cancel_token()));
        let result = if stmt.columns().is_empty() {
            self.client
                .execute(&stmt, &refs)
                .await
                .map(|count| RowSet::affected(count, None))
        } else {
            self.client.query(&stmt, &refs).await.map(|rows| {
                let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
                let affected = rows.len() as u64;
                let mut set =
                    RowSet::from_rows(columns, rows.iter().map(Self::convert_row).collect());
                if classify(sql) == OperationKind::Write {
                    set.rows_affected = affected;
                }
                set
            })
        };
        cancel.disarm();
        result.map_err(db_error)
    }
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}
