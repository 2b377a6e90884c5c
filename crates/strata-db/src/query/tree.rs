//! The immutable expression tree behind every query set.
//!
//! Each chain method produces a new [`ExpressionTree`] that shares everything
//! it did not change with its parent. Conditions live in a persistent
//! [`Chain`], so appending a filter is O(1) and two branches built from the
//! same base never observe each other.

use std::fmt;
use std::sync::Arc;

use strata_core::{StrataError, StrataResult};

use crate::model::{ColumnDef, ModelDescriptor, RelationDef};
use crate::query::lookups::Condition;

/// A persistent, append-only list shared between trees.
pub struct Chain<T> {
    head: Option<Arc<Link<T>>>,
}

struct Link<T> {
    item: T,
    prev: Option<Arc<Link<T>>>,
    len: usize,
}

impl<T> Chain<T> {
    /// Creates an empty chain.
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Returns a new chain with `item` appended; `self` is unchanged.
    #[must_use]
    pub fn push(&self, item: T) -> Self {
        Self {
            head: Some(Arc::new(Link {
                item,
                prev: self.head.clone(),
                len: self.len() + 1,
            })),
        }
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, |link| link.len)
    }

    /// Returns `true` if the chain has no items.
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the items in insertion order.
    pub fn to_vec(&self) -> Vec<&T> {
        let mut items = Vec::with_capacity(self.len());
        let mut cursor = self.head.as_deref();
        while let Some(link) = cursor {
            items.push(&link.item);
            cursor = link.prev.as_deref();
        }
        items.reverse();
        items
    }
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
        }
    }
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}

/// The pagination window: rows `offset..offset + limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    /// Rows skipped from the start.
    pub offset: u64,
    /// Maximum number of rows, `None` for unbounded.
    pub limit: Option<u64>,
}

impl Window {
    /// Narrows the window to at most `n` rows.
    #[must_use]
    pub fn limit(self, n: u64) -> Self {
        Self {
            offset: self.offset,
            limit: Some(self.limit.map_or(n, |existing| existing.min(n))),
        }
    }

    /// Skips `m` more rows of the current window.
    #[must_use]
    pub fn offset(self, m: u64) -> Self {
        Self {
            offset: self.offset.saturating_add(m),
            limit: self.limit.map(|existing| existing.saturating_sub(m)),
        }
    }

    /// Returns `true` if the window selects every row.
    pub const fn is_unbounded(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }
}

/// What each result row becomes.
#[derive(Debug, Clone)]
pub enum Projection {
    /// Full rows, materialized as model instances.
    Model,
    /// The named columns (plus annotations), as records or tuples.
    Fields(Arc<[&'static ColumnDef]>),
    /// A single column, as scalars.
    Flat(&'static ColumnDef),
}

impl Projection {
    /// Returns the projected columns; `None` means every column.
    pub fn columns(&self) -> Option<Vec<&'static ColumnDef>> {
        match self {
            Self::Model => None,
            Self::Fields(columns) => Some(columns.to_vec()),
            Self::Flat(column) => Some(vec![*column]),
        }
    }
}

/// An `ORDER BY` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortField {
    /// A column of the queried model.
    Column(&'static ColumnDef),
    /// An annotation alias.
    Alias(String),
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// What to sort by.
    pub field: SortField,
    /// `true` for descending order.
    pub descending: bool,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunc {
    /// `COUNT`.
    Count,
    /// `SUM`.
    Sum,
    /// `AVG`.
    Avg,
    /// `MIN`.
    Min,
    /// `MAX`.
    Max,
}

impl AggregateFunc {
    /// Returns the SQL function name.
    pub const fn sql_name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// An aggregate over one field, as passed to `aggregate` and `annotate`.
///
/// # Examples
///
/// ```
/// use strata_db::query::Aggregate;
///
/// let total = Aggregate::count("id");
/// let mean = Aggregate::avg("age");
/// let authors = Aggregate::count("author_id").distinct();
/// assert!(authors.is_distinct());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    func: AggregateFunc,
    field: Option<String>,
    distinct: bool,
}

impl Aggregate {
    fn new(func: AggregateFunc, field: Option<String>) -> Self {
        Self {
            func,
            field,
            distinct: false,
        }
    }

    /// `COUNT(field)`: non-null values of `field`.
    pub fn count(field: impl Into<String>) -> Self {
        Self::new(AggregateFunc::Count, Some(field.into()))
    }

    /// `COUNT(*)`: every row.
    pub fn count_all() -> Self {
        Self::new(AggregateFunc::Count, None)
    }

    /// `SUM(field)`.
    pub fn sum(field: impl Into<String>) -> Self {
        Self::new(AggregateFunc::Sum, Some(field.into()))
    }

    /// `AVG(field)`.
    pub fn avg(field: impl Into<String>) -> Self {
        Self::new(AggregateFunc::Avg, Some(field.into()))
    }

    /// `MIN(field)`.
    pub fn min(field: impl Into<String>) -> Self {
        Self::new(AggregateFunc::Min, Some(field.into()))
    }

    /// `MAX(field)`.
    pub fn max(field: impl Into<String>) -> Self {
        Self::new(AggregateFunc::Max, Some(field.into()))
    }

    /// Aggregates distinct values only.
    #[must_use]
    pub const fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Returns the aggregate function.
    pub const fn func(&self) -> AggregateFunc {
        self.func
    }

    /// Returns `true` if only distinct values are aggregated.
    pub const fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Validates the aggregate against `model` and binds it to `alias`.
    pub(crate) fn bind(
        &self,
        alias: &str,
        model: &'static ModelDescriptor,
    ) -> StrataResult<BoundAggregate> {
        let column = match &self.field {
            None => None,
            Some(name) if name == "*" => None,
            Some(name) => Some(model.require_column(name)?),
        };
        let unsupported = |what: &str| {
            StrataError::UnsupportedOperation(format!(
                "{}({}) {what}",
                self.func.sql_name(),
                self.field.as_deref().unwrap_or("*")
            ))
        };
        match (self.func, column) {
            (AggregateFunc::Count, _) => {}
            (_, None) => return Err(unsupported("requires a field")),
            (AggregateFunc::Sum | AggregateFunc::Avg, Some(c)) if !c.semantic_type.is_numeric() => {
                return Err(unsupported("requires a numeric field"));
            }
            (AggregateFunc::Min | AggregateFunc::Max, Some(c)) if !c.semantic_type.is_ordered() => {
                return Err(unsupported("requires an ordered field"));
            }
            _ => {}
        }
        if alias.is_empty() || alias.contains('"') || alias.contains('`') {
            return Err(StrataError::UnsupportedOperation(format!(
                "invalid aggregate alias '{alias}'"
            )));
        }
        Ok(BoundAggregate {
            alias: alias.to_string(),
            func: self.func,
            column,
            distinct: self.distinct,
        })
    }
}

/// An aggregate validated against a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAggregate {
    /// The result key.
    pub alias: String,
    /// The function.
    pub func: AggregateFunc,
    /// The aggregated column; `None` for `COUNT(*)`.
    pub column: Option<&'static ColumnDef>,
    /// Whether `DISTINCT` applies.
    pub distinct: bool,
}

/// All accumulated clauses of a query.
#[derive(Debug, Clone)]
pub struct ExpressionTree {
    pub(crate) conditions: Chain<Condition>,
    pub(crate) ordering: Arc<[SortKey]>,
    pub(crate) window: Window,
    pub(crate) projection: Projection,
    pub(crate) distinct: bool,
    pub(crate) eager: Arc<[&'static RelationDef]>,
    pub(crate) annotations: Arc<[BoundAggregate]>,
    pub(crate) empty: bool,
}

impl Default for ExpressionTree {
    fn default() -> Self {
        Self {
            conditions: Chain::new(),
            ordering: Arc::from(Vec::new()),
            window: Window::default(),
            projection: Projection::Model,
            distinct: false,
            eager: Arc::from(Vec::new()),
            annotations: Arc::from(Vec::new()),
            empty: false,
        }
    }
}

impl ExpressionTree {
    /// Returns the conditions in the order they were added.
    pub fn conditions(&self) -> Vec<&Condition> {
        self.conditions.to_vec()
    }

    /// Returns the sort keys.
    pub fn ordering(&self) -> &[SortKey] {
        &self.ordering
    }

    /// Returns the pagination window.
    pub const fn window(&self) -> Window {
        self.window
    }

    /// Returns the projection.
    pub const fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Returns `true` if `DISTINCT` applies.
    pub const fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Returns the eagerly loaded relations.
    pub fn eager(&self) -> &[&'static RelationDef] {
        &self.eager
    }

    /// Returns the annotations.
    pub fn annotations(&self) -> &[BoundAggregate] {
        &self.annotations
    }

    /// Returns `true` if the tree can match no rows at all.
    pub const fn is_empty_set(&self) -> bool {
        self.empty
    }

    /// Returns `true` if the result has a row set other than "every matching row".
    pub fn is_reshaped(&self) -> bool {
        !self.window.is_unbounded() || self.distinct || !self.annotations.is_empty()
    }

    // ── Deltas ───────────────────────────────────────────────────────

    pub(crate) fn with_condition(&self, condition: Condition) -> Self {
        Self {
            conditions: self.conditions.push(condition),
            ..self.clone()
        }
    }

    pub(crate) fn with_ordering(&self, ordering: Vec<SortKey>) -> Self {
        Self {
            ordering: Arc::from(ordering),
            ..self.clone()
        }
    }

    pub(crate) fn reversed(&self, default_key: SortKey) -> Self {
        let ordering: Vec<SortKey> = if self.ordering.is_empty() {
            vec![default_key]
        } else {
            self.ordering.to_vec()
        };
        self.with_ordering(
            ordering
                .into_iter()
                .map(|key| SortKey {
                    descending: !key.descending,
                    ..key
                })
                .collect(),
        )
    }

    pub(crate) fn with_window(&self, window: Window) -> Self {
        Self {
            window,
            ..self.clone()
        }
    }

    pub(crate) fn with_distinct(&self) -> Self {
        Self {
            distinct: true,
            ..self.clone()
        }
    }

    pub(crate) fn with_eager(&self, relations: Vec<&'static RelationDef>) -> Self {
        let mut eager = self.eager.to_vec();
        for relation in relations {
            if !eager.iter().any(|r| std::ptr::eq(*r, relation)) {
                eager.push(relation);
            }
        }
        Self {
            eager: Arc::from(eager),
            ..self.clone()
        }
    }

    pub(crate) fn with_projection(&self, projection: Projection) -> Self {
        Self {
            projection,
            ..self.clone()
        }
    }

    /// Back to whole-model rows. Annotations are dropped together with any
    /// sort key that names one.
    pub(crate) fn as_model_rows(&self) -> Self {
        let ordering: Vec<SortKey> = self
            .ordering
            .iter()
            .filter(|key| matches!(key.field, SortField::Column(_)))
            .cloned()
            .collect();
        Self {
            projection: Projection::Model,
            ordering: Arc::from(ordering),
            annotations: Arc::from(Vec::new()),
            ..self.clone()
        }
    }

    pub(crate) fn with_annotation(&self, annotation: BoundAggregate) -> Self {
        let mut annotations = self.annotations.to_vec();
        annotations.retain(|a| a.alias != annotation.alias);
        annotations.push(annotation);
        Self {
            annotations: Arc::from(annotations),
            ..self.clone()
        }
    }

    pub(crate) fn emptied(&self) -> Self {
        Self {
            empty: true,
            ..self.clone()
        }
    }

    /// The tree used for counting and aggregating: no eager loading, no ordering.
    pub(crate) fn for_counting(&self) -> Self {
        Self {
            ordering: Arc::from(Vec::new()),
            eager: Arc::from(Vec::new()),
            ..self.clone()
        }
    }
}
