//! QuerySet and Manager for building and executing queries.
//!
//! A [`QuerySet`] is a lazy, immutable query. Chain methods (`filter`,
//! `order_by`, `limit`, ...) validate their arguments against the model
//! descriptor and return a new query set; the original is never changed, so
//! a base query set can be shared and extended in several directions.
//! Nothing touches a connection until a terminal method (`all`, `count`,
//! `get`, ...) is awaited.
//!
//! The second type parameter selects what rows become: typed models by
//! default, [`Record`]s after `values()`, tuples after `values_list()` and
//! scalars after `values_list().flat()`.
//!
//! # Examples
//!
//! ```
//! use std::sync::LazyLock;
//! use strata_core::StrataResult;
//! use strata_db::model::{ColumnDef, Model, ModelDescriptor, SemanticType};
//! use strata_db::query::Instance;
//! use strata_db::DatabaseBackendType;
//!
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! static USERS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
//!     ModelDescriptor::builder("users")
//!         .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
//!         .column(ColumnDef::new("name", SemanticType::Text))
//!         .column(ColumnDef::new("age", SemanticType::Integer))
//!         .build()
//!         .expect("valid descriptor")
//! });
//!
//! impl Model for User {
//!     fn descriptor() -> &'static ModelDescriptor {
//!         &USERS
//!     }
//!
//!     fn from_instance(instance: &Instance) -> StrataResult<Self> {
//!         Ok(Self {
//!             id: instance.get("id")?,
//!             name: instance.get("name")?,
//!         })
//!     }
//! }
//!
//! # fn main() -> StrataResult<()> {
//! let adults = User::objects().filter([("age__gte", 18)])?;
//! let page = adults.order_by(["-age", "name"])?.offset(20).limit(10);
//!
//! assert_eq!(
//!     page.to_sql(DatabaseBackendType::PostgreSQL),
//!     "SELECT \"users\".\"id\", \"users\".\"name\", \"users\".\"age\" FROM \"users\" \
//!      WHERE \"users\".\"age\" >= $1 ORDER BY \"users\".\"age\" DESC, \"users\".\"name\" ASC \
//!      LIMIT 10 OFFSET 20"
//! );
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use strata_core::logging::query_span;
use strata_core::{StrataError, StrataResult};
use tracing::Instrument;

use super::compiler::{check_aggregate, CompiledQuery, SqlCompiler};
use super::lookups::{self, Condition};
use super::materialize::{
    self, AsInstance, AsModel, AsRecord, AsScalar, AsTuple, Materialized, Record, Shape,
};
use super::raw::RawQuerySet;
use super::session::{with_session, Target};
use super::tree::{
    Aggregate, BoundAggregate, ExpressionTree, Projection, SortField, SortKey,
};
use crate::connection::{Connection, RowSet};
use crate::dialect::DatabaseBackendType;
use crate::model::{ColumnDef, Model, ModelDescriptor, SemanticType};
use crate::router::{ConnectionRouter, OperationKind};
use crate::value::Value;

/// Builds an array of `(key, Value)` lookup pairs from mixed value types.
///
/// # Examples
///
/// ```
/// use strata_db::lookups;
/// use strata_db::value::Value;
///
/// let pairs = lookups! { "name__icontains" => "ann", "age__gte" => 18 };
/// assert_eq!(pairs[1], ("age__gte", Value::Int(18)));
/// ```
#[macro_export]
macro_rules! lookups {
    ($($key:expr => $value:expr),* $(,)?) => {
        [$(($key, $crate::value::Value::from($value))),*]
    };
}

// ============================================================================
// Pending
// ============================================================================

/// The deferred I/O of a terminal operation whose arguments were already
/// validated.
///
/// Returned by `get`, `aggregate`, `update`, `delete` and `create`: argument
/// errors surface when the method is called, statement errors when the
/// `Pending` is awaited.
#[must_use = "a Pending does nothing until it is awaited"]
pub struct Pending<T> {
    future: Pin<Box<dyn Future<Output = StrataResult<T>> + Send>>,
}

impl<T: Send + 'static> Pending<T> {
    fn new(future: impl Future<Output = StrataResult<T>> + Send + 'static) -> Self {
        Self {
            future: Box::pin(future),
        }
    }

    fn ready(value: T) -> Self {
        Self::new(std::future::ready(Ok(value)))
    }
}

impl<T> Future for Pending<T> {
    type Output = StrataResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// The entry point for queries on a model, returned by `Model::objects()`.
///
/// The manager holds no query state. It only remembers where statements
/// should go and hands out fresh query sets.
pub struct Manager<M: Model> {
    target: Target,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Default for Manager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> Clone for Manager<M> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> std::fmt::Debug for Manager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("table", &M::descriptor().table_name())
            .field("target", &self.target)
            .finish()
    }
}

impl<M: Model> Manager<M> {
    /// Creates a manager that routes through the global router.
    pub fn new() -> Self {
        Self {
            target: Target::default(),
            _model: PhantomData,
        }
    }

    /// Routes every query set of this manager through `router`.
    #[must_use]
    pub fn with_router(mut self, router: Arc<ConnectionRouter>) -> Self {
        self.target.router = Some(router);
        self
    }

    /// Binds every query set of this manager to an explicit connection.
    #[must_use]
    pub fn using(mut self, connection: Arc<dyn Connection>) -> Self {
        self.target.connection = Some(connection);
        self
    }

    /// Returns a query set over every row.
    pub fn all(&self) -> QuerySet<M> {
        QuerySet::new(self.target.clone())
    }

    /// Shortcut for `all().filter(lookups)`.
    pub fn filter<I, K, V>(&self, lookups: I) -> StrataResult<QuerySet<M>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.all().filter(lookups)
    }

    /// Shortcut for `all().exclude(lookups)`.
    pub fn exclude<I, K, V>(&self, lookups: I) -> StrataResult<QuerySet<M>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.all().exclude(lookups)
    }

    /// Returns a query set that matches nothing.
    pub fn none(&self) -> QuerySet<M> {
        self.all().none()
    }

    /// Shortcut for `all().get(lookups)`.
    pub fn get<I, K, V>(&self, lookups: I) -> StrataResult<Pending<M>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.all().get(lookups)
    }

    /// Shortcut for `all().get_or_none(lookups)`.
    pub fn get_or_none<I, K, V>(&self, lookups: I) -> StrataResult<Pending<Option<M>>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.all().get_or_none(lookups)
    }

    /// Counts every row.
    pub async fn count(&self) -> StrataResult<u64> {
        self.all().count().await
    }

    /// Returns `true` if the table has any row.
    pub async fn exists(&self) -> StrataResult<bool> {
        self.all().exists().await
    }

    /// Inserts one row and returns its primary key.
    pub fn create<I, K, V>(&self, assignments: I) -> StrataResult<Pending<Value>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.all().create(assignments)
    }

    /// Starts a raw SQL query whose rows materialize as this model.
    pub fn raw(&self, sql: impl Into<String>, params: Vec<Value>) -> RawQuerySet<M> {
        RawQuerySet::new(sql.into(), params, self.target.clone())
    }
}

// ============================================================================
// QuerySet
// ============================================================================

/// A lazy, immutable query over the rows of `M`.
///
/// `S` decides what each row becomes; see the module documentation.
pub struct QuerySet<M: Model, S = AsModel> {
    tree: ExpressionTree,
    target: Target,
    _marker: PhantomData<fn() -> (M, S)>,
}

impl<M: Model, S> Clone for QuerySet<M, S> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            target: self.target.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: Model, S> std::fmt::Debug for QuerySet<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySet")
            .field("table", &M::descriptor().table_name())
            .field("tree", &self.tree)
            .field("target", &self.target)
            .finish()
    }
}

impl<M: Model> QuerySet<M> {
    fn new(target: Target) -> Self {
        Self {
            tree: ExpressionTree::default(),
            target,
            _marker: PhantomData,
        }
    }
}

impl<M: Model, S: 'static> QuerySet<M, S> {
    fn model() -> &'static ModelDescriptor {
        M::descriptor()
    }

    fn derive(&self, tree: ExpressionTree) -> Self {
        Self {
            tree,
            target: self.target.clone(),
            _marker: PhantomData,
        }
    }

    fn reshape<T>(&self, tree: ExpressionTree) -> QuerySet<M, T> {
        QuerySet {
            tree,
            target: self.target.clone(),
            _marker: PhantomData,
        }
    }

    fn parse_all<I, K, V>(pairs: I) -> StrataResult<Vec<Condition>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        pairs
            .into_iter()
            .map(|(key, value)| lookups::parse(key.as_ref(), value.into(), Self::model()))
            .collect()
    }

    // ── Chain methods ────────────────────────────────────────────────

    /// Narrows the query set to rows matching every lookup.
    ///
    /// Keys use the `field__operator` syntax (`age__gte`,
    /// `author__name__icontains`); a key without an operator means `exact`.
    pub fn filter<I, K, V>(&self, lookups: I) -> StrataResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let tree = Self::parse_all(lookups)?
            .into_iter()
            .fold(self.tree.clone(), |tree, cond| tree.with_condition(cond));
        Ok(self.derive(tree))
    }

    /// Removes rows matching any of the lookups.
    ///
    /// Each lookup is negated on its own, so `exclude([a, b])` is the same
    /// as `exclude([a]).exclude([b])`. A row whose field is NULL never
    /// matches a comparison and is therefore kept.
    pub fn exclude<I, K, V>(&self, lookups: I) -> StrataResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let tree = Self::parse_all(lookups)?
            .into_iter()
            .fold(self.tree.clone(), |tree, cond| tree.with_condition(cond.negate()));
        Ok(self.derive(tree))
    }

    /// Replaces the sort order. A leading `-` sorts descending.
    ///
    /// Fields are columns of the model or aliases added by `annotate`.
    pub fn order_by<I, K>(&self, fields: I) -> StrataResult<Self>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let model = Self::model();
        let keys = fields
            .into_iter()
            .map(|field| {
                let field = field.as_ref();
                let (name, descending) = field
                    .strip_prefix('-')
                    .map_or((field, false), |name| (name, true));
                let field = if let Some(column) = model.column(name) {
                    SortField::Column(column)
                } else if self.tree.annotations().iter().any(|a| a.alias == name) {
                    SortField::Alias(name.to_string())
                } else {
                    return Err(StrataError::UnknownField {
                        model: model.table_name().to_string(),
                        field: name.to_string(),
                    });
                };
                Ok(SortKey { field, descending })
            })
            .collect::<StrataResult<Vec<_>>>()?;
        Ok(self.derive(self.tree.with_ordering(keys)))
    }

    /// Flips the direction of every sort key. An unordered query set is
    /// ordered by descending primary key.
    #[must_use]
    pub fn reverse(&self) -> Self {
        let default_key = SortKey {
            field: SortField::Column(Self::model().primary_key()),
            descending: false,
        };
        self.derive(self.tree.reversed(default_key))
    }

    /// Keeps at most `n` rows of the current window.
    #[must_use]
    pub fn limit(&self, n: u64) -> Self {
        self.derive(self.tree.with_window(self.tree.window().limit(n)))
    }

    /// Skips the first `m` rows of the current window.
    #[must_use]
    pub fn offset(&self, m: u64) -> Self {
        self.derive(self.tree.with_window(self.tree.window().offset(m)))
    }

    /// Removes duplicate rows.
    #[must_use]
    pub fn distinct(&self) -> Self {
        self.derive(self.tree.with_distinct())
    }

    /// Loads the named relations together with the rows.
    ///
    /// Many-to-one and one-to-one relations are joined into the same
    /// statement; each one-to-many relation costs one extra keyed query.
    pub fn select_related<I, K>(&self, relations: I) -> StrataResult<Self>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let model = Self::model();
        let relations = relations
            .into_iter()
            .map(|name| model.require_relation(name.as_ref()))
            .collect::<StrataResult<Vec<_>>>()?;
        Ok(self.derive(self.tree.with_eager(relations)))
    }

    /// Returns a query set that matches nothing and never runs a statement.
    #[must_use]
    pub fn none(&self) -> Self {
        self.derive(self.tree.emptied())
    }

    /// Sends every statement to `connection`, bypassing replica selection.
    /// The engine never closes an explicit connection.
    #[must_use]
    pub fn using(&self, connection: Arc<dyn Connection>) -> Self {
        let mut qs = self.clone();
        qs.target.connection = Some(connection);
        qs
    }

    /// Routes statements through `router` instead of the global router.
    #[must_use]
    pub fn with_router(&self, router: Arc<ConnectionRouter>) -> Self {
        let mut qs = self.clone();
        qs.target.router = Some(router);
        qs
    }

    fn project<K: AsRef<str>>(
        &self,
        fields: impl IntoIterator<Item = K>,
    ) -> StrataResult<ExpressionTree> {
        let model = Self::model();
        let mut columns: Vec<&'static ColumnDef> = fields
            .into_iter()
            .map(|name| model.require_column(name.as_ref()))
            .collect::<StrataResult<_>>()?;
        if columns.is_empty() {
            columns = model.columns().iter().collect();
        }
        Ok(self
            .tree
            .with_projection(Projection::Fields(Arc::from(columns))))
    }

    /// Returns rows as [`Record`]s of the named fields (all fields if none
    /// are named).
    pub fn values<I, K>(&self, fields: I) -> StrataResult<QuerySet<M, AsRecord>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        Ok(self.reshape(self.project(fields)?))
    }

    /// Returns rows as tuples of the named fields (all fields if none are
    /// named).
    pub fn values_list<I, K>(&self, fields: I) -> StrataResult<QuerySet<M, AsTuple>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        Ok(self.reshape(self.project(fields)?))
    }

    /// Returns rows as untyped [`Instance`](super::Instance)s.
    ///
    /// Annotations, and sort keys naming them, do not carry over.
    pub fn as_instances(&self) -> QuerySet<M, AsInstance> {
        self.reshape(self.tree.as_model_rows())
    }

    /// Adds a per-group aggregate column under `alias`.
    ///
    /// Rows are grouped by the fields selected with `values` or
    /// `values_list`, which must come first.
    pub fn annotate(&self, alias: &str, aggregate: &Aggregate) -> StrataResult<Self> {
        let model = Self::model();
        let Projection::Fields(columns) = self.tree.projection() else {
            return Err(StrataError::UnsupportedOperation(
                "annotate() requires values() or values_list() first".to_string(),
            ));
        };
        if columns.iter().any(|c| c.name == alias) {
            return Err(StrataError::UnsupportedOperation(format!(
                "annotation '{alias}' conflicts with a selected field"
            )));
        }
        let bound = aggregate.bind(alias, model)?;
        Ok(self.derive(self.tree.with_annotation(bound)))
    }

    /// Returns the expression tree.
    pub const fn tree(&self) -> &ExpressionTree {
        &self.tree
    }

    /// Compiles the row-returning statement for `backend` without running it.
    pub fn compile(&self, backend: DatabaseBackendType) -> CompiledQuery {
        SqlCompiler::new(backend).compile_select(&self.tree, Self::model())
    }

    /// Renders the row-returning statement for `backend`, for debugging.
    pub fn to_sql(&self, backend: DatabaseBackendType) -> String {
        self.compile(backend).sql
    }

    fn span(operation: &str) -> tracing::Span {
        query_span(Self::model().table_name(), operation)
    }

    /// Resolves `(field, value)` pairs into typed column assignments.
    fn assignments<I, K, V>(assignments: I) -> StrataResult<Vec<(&'static ColumnDef, Value)>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let model = Self::model();
        let mut resolved: Vec<(&'static ColumnDef, Value)> = Vec::new();
        for (name, value) in assignments {
            let column = model.require_column(name.as_ref())?;
            let value = column.semantic_type.coerce(value.into());
            if value.is_null() && !column.nullable {
                return Err(StrataError::UnsupportedOperation(format!(
                    "field '{}' is not nullable",
                    column.name
                )));
            }
            if !value.is_null() && !column.semantic_type.accepts(&value) {
                return Err(StrataError::UnsupportedOperation(format!(
                    "field '{}' expects a {} value, got {value:?}",
                    column.name, column.semantic_type
                )));
            }
            if resolved.iter().any(|(c, _)| std::ptr::eq(*c, column)) {
                return Err(StrataError::UnsupportedOperation(format!(
                    "field '{}' assigned twice",
                    column.name
                )));
            }
            resolved.push((column, value));
        }
        Ok(resolved)
    }

    fn check_mutable(&self, operation: &str) -> StrataResult<()> {
        let reason = if !self.tree.window().is_unbounded() {
            Some("limit() or offset()")
        } else if !matches!(self.tree.projection(), Projection::Model) {
            Some("values() or values_list()")
        } else if !self.tree.annotations().is_empty() {
            Some("annotate()")
        } else if self.tree.is_distinct() {
            Some("distinct()")
        } else {
            None
        };
        reason.map_or(Ok(()), |reason| {
            Err(StrataError::UnsupportedOperation(format!(
                "cannot {operation} a query set after {reason}"
            )))
        })
    }

    /// Counts the rows the query set selects.
    pub async fn count(&self) -> StrataResult<u64> {
        if self.tree.is_empty_set() {
            return Ok(0);
        }
        async {
            with_session!(&self.target, OperationKind::Read, |session| {
                let query = session.compiler().compile_count(&self.tree, Self::model());
                let set = session.run(&query).await?;
                let count = set
                    .scalar()
                    .cloned()
                    .map(|v| SemanticType::Integer.coerce(v));
                match count {
                    Some(Value::Int(n)) => u64::try_from(n).map_err(|_| {
                        StrataError::DatabaseError(format!("negative row count {n}"))
                    }),
                    other => Err(StrataError::DatabaseError(format!(
                        "expected an integer count, got {other:?}"
                    ))),
                }
            })
        }
        .instrument(Self::span("count"))
        .await
    }

    /// Returns `true` if the query set selects at least one row.
    pub async fn exists(&self) -> StrataResult<bool> {
        if self.tree.is_empty_set() {
            return Ok(false);
        }
        async {
            with_session!(&self.target, OperationKind::Read, |session| {
                let query = session.compiler().compile_exists(&self.tree, Self::model());
                let set = session.run(&query).await?;
                Ok(!set.rows.is_empty())
            })
        }
        .instrument(Self::span("exists"))
        .await
    }

    /// Computes aggregates over the selected rows, returned as one
    /// [`Record`] keyed by alias.
    ///
    /// Over no rows, `Count` is `0` and every other function is NULL.
    pub fn aggregate<I, K>(&self, aggregates: I) -> StrataResult<Pending<Record>>
    where
        I: IntoIterator<Item = (K, Aggregate)>,
        K: AsRef<str>,
    {
        let model = Self::model();
        let bound: Vec<BoundAggregate> = aggregates
            .into_iter()
            .map(|(alias, aggregate)| aggregate.bind(alias.as_ref(), model))
            .collect::<StrataResult<_>>()?;
        check_aggregate(&self.tree, &bound)?;
        if self.tree.is_empty_set() {
            return Ok(Pending::ready(materialize::aggregate_record(
                &bound,
                &RowSet::default(),
            )));
        }
        let tree = self.tree.clone();
        let target = self.target.clone();
        Ok(Pending::new(
            async move {
                with_session!(&target, OperationKind::Read, |session| {
                    let query = session.compiler().compile_aggregate(&tree, model, &bound)?;
                    let set = session.run(&query).await?;
                    Ok(materialize::aggregate_record(&bound, &set))
                })
            }
            .instrument(Self::span("aggregate")),
        ))
    }

    /// Updates every selected row and returns the number of rows changed.
    ///
    /// Always runs on the primary.
    pub fn update<I, K, V>(&self, assignments: I) -> StrataResult<Pending<u64>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.check_mutable("update")?;
        let assignments = Self::assignments(assignments)?;
        if assignments.is_empty() {
            return Err(StrataError::UnsupportedOperation(
                "update() requires at least one assignment".to_string(),
            ));
        }
        if self.tree.is_empty_set() {
            return Ok(Pending::ready(0));
        }
        let tree = self.tree.clone();
        let target = self.target.clone();
        Ok(Pending::new(
            async move {
                with_session!(&target, OperationKind::Write, |session| {
                    let query = session
                        .compiler()
                        .compile_update(&tree, Self::model(), &assignments)?;
                    Ok(session.run(&query).await?.rows_affected)
                })
            }
            .instrument(Self::span("update")),
        ))
    }

    /// Deletes every selected row and returns the number of rows removed.
    ///
    /// Always runs on the primary.
    pub fn delete(&self) -> StrataResult<Pending<u64>> {
        self.check_mutable("delete")?;
        if self.tree.is_empty_set() {
            return Ok(Pending::ready(0));
        }
        let tree = self.tree.clone();
        let target = self.target.clone();
        Ok(Pending::new(
            async move {
                with_session!(&target, OperationKind::Write, |session| {
                    let query = session.compiler().compile_delete(&tree, Self::model());
                    Ok(session.run(&query).await?.rows_affected)
                })
            }
            .instrument(Self::span("delete")),
        ))
    }

    /// Inserts one row on the primary and returns its primary key.
    ///
    /// Filters and other clauses of the query set do not apply.
    pub fn create<I, K, V>(&self, assignments: I) -> StrataResult<Pending<Value>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let model = Self::model();
        let assignments = Self::assignments(assignments)?;
        let pk = model.primary_key();
        let explicit_pk = assignments
            .iter()
            .find(|(column, _)| column.primary_key)
            .map(|(_, value)| value.clone());
        let target = self.target.clone();
        Ok(Pending::new(
            async move {
                with_session!(&target, OperationKind::Write, |session| {
                    let query = session.compiler().compile_insert(model, &assignments);
                    let set = session.run(&query).await?;
                    if let Some(value) = explicit_pk {
                        return Ok(value);
                    }
                    match (set.scalar(), set.last_insert_id) {
                        (Some(value), _) if !value.is_null() => {
                            Ok(pk.semantic_type.coerce(value.clone()))
                        }
                        (_, Some(id)) => Ok(Value::Int(id)),
                        _ => Err(StrataError::DatabaseError(format!(
                            "insert into '{}' did not report a primary key",
                            model.table_name()
                        ))),
                    }
                })
            }
            .instrument(Self::span("create")),
        ))
    }

    /// Starts a raw SQL query that shares this query set's routing.
    pub fn raw(&self, sql: impl Into<String>, params: Vec<Value>) -> RawQuerySet<M> {
        RawQuerySet::new(sql.into(), params, self.target.clone())
    }
}

impl<M: Model> QuerySet<M, AsTuple> {
    /// Returns single values instead of one-element tuples.
    ///
    /// Requires exactly one selected field and no annotations.
    pub fn flat(&self) -> StrataResult<QuerySet<M, AsScalar>> {
        let Projection::Fields(columns) = self.tree.projection() else {
            return Err(StrataError::ProjectionArity(
                "flat() requires values_list()".to_string(),
            ));
        };
        match (columns.as_ref(), self.tree.annotations()) {
            ([column], []) => Ok(self.reshape(self.tree.with_projection(Projection::Flat(*column)))),
            (columns, annotations) => Err(StrataError::ProjectionArity(format!(
                "flat() requires exactly one field, got {}",
                columns.len() + annotations.len()
            ))),
        }
    }
}

impl<M: Model, S: Shape<M>> QuerySet<M, S> {
    /// Runs the query and returns every selected row.
    pub async fn all(&self) -> StrataResult<Vec<S::Output>> {
        load(Self::model(), &self.tree, &self.target)
            .instrument(Self::span("all"))
            .await?
            .into_iter()
            .map(S::shape)
            .collect()
    }

    /// Runs the query with `limit(1)` and returns the row, if any.
    pub async fn first(&self) -> StrataResult<Option<S::Output>> {
        let tree = self.tree.with_window(self.tree.window().limit(1));
        load(Self::model(), &tree, &self.target)
            .instrument(Self::span("first"))
            .await?
            .into_iter()
            .next()
            .map(S::shape)
            .transpose()
    }

    fn probe<I, K, V>(
        &self,
        lookups: I,
    ) -> StrataResult<impl Future<Output = StrataResult<Vec<Materialized>>> + Send + 'static>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let filtered = self.filter(lookups)?;
        let tree = filtered
            .tree
            .with_window(filtered.tree.window().limit(2));
        let target = filtered.target;
        Ok(async move { load(Self::model(), &tree, &target).await }.instrument(Self::span("get")))
    }

    /// Returns the single row matching `lookups`.
    ///
    /// Fails with `DoesNotExist` when no row matches and with
    /// `MultipleObjectsReturned` when more than one does.
    pub fn get<I, K, V>(&self, lookups: I) -> StrataResult<Pending<S::Output>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let probe = self.probe(lookups)?;
        let table = Self::model().table_name();
        Ok(Pending::new(async move {
            let mut rows = probe.await?;
            match rows.len() {
                0 => Err(StrataError::DoesNotExist(format!(
                    "{table} matching query does not exist."
                ))),
                1 => rows.pop().map_or_else(
                    || Err(StrataError::DoesNotExist(table.to_string())),
                    S::shape,
                ),
                _ => Err(StrataError::MultipleObjectsReturned(format!(
                    "get() returned more than one {table}"
                ))),
            }
        }))
    }

    /// Like [`get`](Self::get), but returns `None` when no row matches.
    pub fn get_or_none<I, K, V>(&self, lookups: I) -> StrataResult<Pending<Option<S::Output>>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let get = self.get(lookups)?;
        Ok(Pending::new(async move {
            match get.await {
                Ok(row) => Ok(Some(row)),
                Err(StrataError::DoesNotExist(_)) => Ok(None),
                Err(err) => Err(err),
            }
        }))
    }
}

/// Runs the select of `tree` and materializes its rows, including any
/// one-to-many relations loaded with supplemental queries.
async fn load(
    model: &'static ModelDescriptor,
    tree: &ExpressionTree,
    target: &Target,
) -> StrataResult<Vec<Materialized>> {
    if tree.is_empty_set() {
        return Ok(Vec::new());
    }
    with_session!(target, OperationKind::Read, |session| {
        let query = session.compiler().compile_select(tree, model);
        let set = session.run(&query).await?;
        match tree.projection() {
            Projection::Model => {
                let mut rows = materialize::instances(model, tree.eager(), &set);
                for &relation in tree.eager() {
                    if relation.cardinality.is_forward() {
                        continue;
                    }
                    let keys = materialize::parent_keys(&rows);
                    if keys.is_empty() {
                        materialize::attach_empty(&mut rows, relation);
                        continue;
                    }
                    let query = session.compiler().compile_eager_many(relation, &keys)?;
                    let children = session.run(&query).await?;
                    materialize::attach_many(&mut rows, relation, &children)?;
                }
                Ok(rows.into_iter().map(Materialized::Instance).collect())
            }
            Projection::Fields(columns) => Ok(materialize::records(columns, tree.annotations(), &set)
                .into_iter()
                .map(Materialized::Record)
                .collect()),
            Projection::Flat(column) => Ok(materialize::scalars(*column, &set)
                .into_iter()
                .map(Materialized::Scalar)
                .collect()),
        }
    })
}
