//! Raw SQL.
//!
//! [`RawQuerySet`] bypasses the compiler entirely: the statement is sent as
//! written, with its parameters bound. It is still routed like any other
//! terminal call. [`classify`] infers whether the statement reads or writes
//! from its leading keyword, so a raw `SELECT` goes to a replica and a raw
//! `UPDATE` to the primary.
//!
//! Parameters must use the placeholder syntax of the target backend (`$1`
//! for PostgreSQL, `?` for SQLite and MySQL).

use std::marker::PhantomData;
use std::sync::Arc;

use strata_core::StrataResult;
use tracing::Instrument;

use crate::connection::{Connection, RowSet};
use crate::model::Model;
use crate::query::materialize::{self, Instance};
use crate::query::session::{with_session, Target};
use crate::router::{ConnectionRouter, OperationKind};
use crate::value::Value;

/// Keywords that start a statement without side effects.
const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "SHOW", "EXPLAIN", "PRAGMA", "VALUES", "DESCRIBE"];
/// Keywords that make a `WITH` statement a write.
const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

/// Infers whether a statement reads or writes from its leading keyword.
///
/// Leading whitespace, comments and parentheses are skipped. A `WITH`
/// statement containing a data-modifying keyword is a write, as is a
/// `PRAGMA` that assigns a value. Anything unrecognized is a write.
///
/// # Examples
///
/// ```
/// use strata_db::query::raw::classify;
/// use strata_db::router::OperationKind;
///
/// assert_eq!(classify("  select * from users"), OperationKind::Read);
/// assert_eq!(classify("/* hint */ (SELECT 1)"), OperationKind::Read);
/// assert_eq!(classify("UPDATE users SET name = ?"), OperationKind::Write);
/// assert_eq!(classify("WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x"), OperationKind::Write);
/// ```
pub fn classify(sql: &str) -> OperationKind {
    let body = skip_preamble(sql);
    let keyword: String = body
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase();

    if !READ_KEYWORDS.contains(&keyword.as_str()) {
        return OperationKind::Write;
    }
    match keyword.as_str() {
        "WITH" if tokens(body).any(|t| WRITE_KEYWORDS.contains(&t.as_str())) => OperationKind::Write,
        "PRAGMA" if body.contains('=') => OperationKind::Write,
        _ => OperationKind::Read,
    }
}

fn skip_preamble(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.find('\n').map_or("", |idx| &after[idx + 1..]);
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |idx| &after[idx + 2..]);
        } else {
            return trimmed;
        }
    }
}

fn tokens(sql: &str) -> impl Iterator<Item = String> + '_ {
    sql.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_ascii_uppercase)
}

/// A raw SQL statement bound to a model.
///
/// Result columns are matched to the model's fields by name; use
/// [`translate`](Self::translate) when they differ.
pub struct RawQuerySet<M: Model> {
    sql: String,
    params: Vec<Value>,
    translations: Vec<(String, String)>,
    target: Target,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for RawQuerySet<M> {
    fn clone(&self) -> Self {
        Self {
            sql: self.sql.clone(),
            params: self.params.clone(),
            translations: self.translations.clone(),
            target: self.target.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> RawQuerySet<M> {
    pub(crate) fn new(sql: String, params: Vec<Value>, target: Target) -> Self {
        Self {
            sql,
            params,
            translations: Vec::new(),
            target,
            _model: PhantomData,
        }
    }

    /// Maps result column names to model field names, as
    /// `(sql_column, field)` pairs.
    #[must_use]
    pub fn translate<I, A, B>(mut self, translations: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        self.translations = translations
            .into_iter()
            .map(|(from, to)| (from.into(), to.into()))
            .collect();
        self
    }

    /// Binds the statement to an explicit connection.
    #[must_use]
    pub fn using(mut self, connection: Arc<dyn Connection>) -> Self {
        self.target.connection = Some(connection);
        self
    }

    /// Routes the statement through `router` instead of the global router.
    #[must_use]
    pub fn with_router(mut self, router: Arc<ConnectionRouter>) -> Self {
        self.target.router = Some(router);
        self
    }

    /// Returns the SQL string.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Returns the parameters.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Returns how the statement will be routed.
    pub fn kind(&self) -> OperationKind {
        classify(&self.sql)
    }

    fn span(&self, operation: &str) -> tracing::Span {
        strata_core::logging::query_span(M::descriptor().table_name(), operation)
    }

    /// Runs the statement and returns the raw result.
    pub async fn execute(&self) -> StrataResult<RowSet> {
        let kind = self.kind();
        async {
            with_session!(&self.target, kind, |session| {
                session.run_sql(&self.sql, &self.params).await
            })
        }
        .instrument(self.span("raw"))
        .await
    }

    /// Runs the statement and materializes its rows as instances.
    pub async fn instances(&self) -> StrataResult<Vec<Instance>> {
        let set = self.execute().await?;
        Ok(materialize::raw_instances(M::descriptor(), &self.translations, &set))
    }

    /// Runs the statement and builds typed models from its rows.
    pub async fn all(&self) -> StrataResult<Vec<M>> {
        self.instances().await?.iter().map(M::from_instance).collect()
    }

    /// Runs the statement and returns the first model, if any.
    pub async fn first(&self) -> StrataResult<Option<M>> {
        self.instances()
            .await?
            .first()
            .map(M::from_instance)
            .transpose()
    }
}

impl<M: Model> std::fmt::Debug for RawQuerySet<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawQuerySet")
            .field("sql", &self.sql)
            .field("params", &self.params)
            .field("translations", &self.translations)
            .finish_non_exhaustive()
    }
}
