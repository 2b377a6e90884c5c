//! Result materialization.
//!
//! Turns the rows of a [`RowSet`] into the shape the query set asked for:
//! model [`Instance`]s (with eager-loaded relations attached), ordered
//! [`Record`]s, tuples, scalars, or the single record of an aggregate. Every
//! cell is coerced to its column's [`SemanticType`] on the way, so callers
//! see the same values whichever store produced them.
//!
//! Materialization never performs I/O. A relation that was not loaded with
//! `select_related` is reported as such instead of being fetched lazily.

use std::collections::HashMap;
use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};
use strata_core::{StrataError, StrataResult};

use crate::connection::RowSet;
use crate::model::{ColumnDef, Model, ModelDescriptor, RelationDef, SemanticType};
use crate::query::compiler::related_column_alias;
use crate::query::tree::{AggregateFunc, BoundAggregate};
use crate::row::{FromValue, Row};
use crate::value::Value;

/// An ordered mapping of field name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    /// Returns the value of a field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Returns a field converted to `T`.
    pub fn get_as<T: FromValue>(&self, name: &str) -> StrataResult<T> {
        let value = self.get(name).ok_or_else(|| {
            StrataError::DatabaseError(format!("Field '{name}' not found in record"))
        })?;
        T::from_value(value)
    }

    /// Returns the field names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Iterates over `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Consumes the record, returning the values in order.
    pub fn into_values(self) -> Vec<Value> {
        self.fields.into_iter().map(|(_, v)| v).collect()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// An eager-loaded relation of an [`Instance`].
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// A forward relation; `None` when the join column was NULL.
    One(Option<Box<Instance>>),
    /// A one-to-many relation, ordered by the related primary key.
    Many(Vec<Instance>),
}

/// One materialized row of a model.
#[derive(Clone)]
pub struct Instance {
    model: &'static ModelDescriptor,
    fields: Record,
    related: Vec<(String, Related)>,
}

impl Instance {
    /// Returns the model descriptor.
    pub fn model(&self) -> &'static ModelDescriptor {
        self.model
    }

    /// Returns the column values.
    pub fn fields(&self) -> &Record {
        &self.fields
    }

    /// Returns the raw value of a column.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a column converted to `T`.
    pub fn get<T: FromValue>(&self, field: &str) -> StrataResult<T> {
        let value = self.value(field).ok_or_else(|| StrataError::UnknownField {
            model: self.model.table_name().to_string(),
            field: field.to_string(),
        })?;
        T::from_value(value)
    }

    /// Returns the primary key value.
    pub fn pk(&self) -> Option<&Value> {
        self.value(&self.model.primary_key().name)
    }

    /// Returns `true` if `relation` was eager-loaded.
    pub fn is_loaded(&self, relation: &str) -> bool {
        self.related.iter().any(|(n, _)| n == relation)
    }

    fn loaded(&self, relation: &str) -> StrataResult<&Related> {
        self.model.require_relation(relation)?;
        self.related
            .iter()
            .find(|(n, _)| n == relation)
            .map(|(_, r)| r)
            .ok_or_else(|| {
                StrataError::UnsupportedOperation(format!(
                    "relation '{relation}' of '{}' was not loaded; add it to select_related()",
                    self.model.table_name()
                ))
            })
    }

    /// Returns a loaded forward relation.
    pub fn related_one(&self, relation: &str) -> StrataResult<Option<&Self>> {
        match self.loaded(relation)? {
            Related::One(instance) => Ok(instance.as_deref()),
            Related::Many(_) => Err(StrataError::UnsupportedOperation(format!(
                "relation '{relation}' is one-to-many; use related_many()"
            ))),
        }
    }

    /// Returns a loaded one-to-many relation.
    pub fn related_many(&self, relation: &str) -> StrataResult<&[Self]> {
        match self.loaded(relation)? {
            Related::Many(instances) => Ok(instances),
            Related::One(_) => Err(StrataError::UnsupportedOperation(format!(
                "relation '{relation}' is not one-to-many; use related_one()"
            ))),
        }
    }

    /// Builds a typed model from a loaded forward relation.
    pub fn related_model<T: Model>(&self, relation: &str) -> StrataResult<Option<T>> {
        self.related_one(relation)?.map(T::from_instance).transpose()
    }

    /// Builds typed models from a loaded one-to-many relation.
    pub fn related_models<T: Model>(&self, relation: &str) -> StrataResult<Vec<T>> {
        self.related_many(relation)?.iter().map(T::from_instance).collect()
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.model, other.model)
            && self.fields == other.fields
            && self.related == other.related
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("table", &self.model.table_name())
            .field("fields", &self.fields)
            .field("related", &self.related)
            .finish()
    }
}

/// One result row before it is shaped for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    /// A model row.
    Instance(Instance),
    /// A `values()` row.
    Record(Record),
    /// A flat `values_list()` row.
    Scalar(Value),
}

/// How a query set hands rows to its caller.
pub trait Shape<M>: Send + 'static {
    /// The item type of `all()`, `first()` and `get()`.
    type Output: Send + 'static;

    /// Converts one materialized row.
    fn shape(item: Materialized) -> StrataResult<Self::Output>;
}

/// Rows become typed models.
#[derive(Debug, Clone, Copy)]
pub struct AsModel;

/// Rows become untyped [`Instance`]s.
#[derive(Debug, Clone, Copy)]
pub struct AsInstance;

/// Rows become [`Record`]s (`values()`).
#[derive(Debug, Clone, Copy)]
pub struct AsRecord;

/// Rows become value tuples (`values_list()`).
#[derive(Debug, Clone, Copy)]
pub struct AsTuple;

/// Rows become single values (`values_list().flat()`).
#[derive(Debug, Clone, Copy)]
pub struct AsScalar;

fn shape_mismatch(expected: &str, item: &Materialized) -> StrataError {
    StrataError::DatabaseError(format!("expected {expected} row, got {item:?}"))
}

impl<M: Model> Shape<M> for AsModel {
    type Output = M;

    fn shape(item: Materialized) -> StrataResult<M> {
        match item {
            Materialized::Instance(instance) => M::from_instance(&instance),
            other => Err(shape_mismatch("a model", &other)),
        }
    }
}

impl<M: 'static> Shape<M> for AsInstance {
    type Output = Instance;

    fn shape(item: Materialized) -> StrataResult<Instance> {
        match item {
            Materialized::Instance(instance) => Ok(instance),
            other => Err(shape_mismatch("a model", &other)),
        }
    }
}

impl<M: 'static> Shape<M> for AsRecord {
    type Output = Record;

    fn shape(item: Materialized) -> StrataResult<Record> {
        match item {
            Materialized::Record(record) => Ok(record),
            Materialized::Instance(instance) => Ok(instance.fields),
            other @ Materialized::Scalar(_) => Err(shape_mismatch("a record", &other)),
        }
    }
}

impl<M: 'static> Shape<M> for AsTuple {
    type Output = Vec<Value>;

    fn shape(item: Materialized) -> StrataResult<Vec<Value>> {
        match item {
            Materialized::Record(record) => Ok(record.into_values()),
            Materialized::Instance(instance) => Ok(instance.fields.into_values()),
            Materialized::Scalar(value) => Ok(vec![value]),
        }
    }
}

impl<M: 'static> Shape<M> for AsScalar {
    type Output = Value;

    fn shape(item: Materialized) -> StrataResult<Value> {
        match item {
            Materialized::Scalar(value) => Ok(value),
            other => Err(shape_mismatch("a scalar", &other)),
        }
    }
}

// ── Row conversion ─────────────────────────────────────────────────────

/// Positions of the descriptor's columns within a result set.
struct Layout {
    columns: Vec<(&'static ColumnDef, usize)>,
}

impl Layout {
    fn new(model: &'static ModelDescriptor, names: &[String], prefix: Option<&RelationDef>) -> Self {
        let columns = model
            .columns()
            .iter()
            .filter_map(|column| {
                let name = prefix.map_or_else(
                    || column.name.clone(),
                    |relation| related_column_alias(relation, column),
                );
                names.iter().position(|n| *n == name).map(|idx| (column, idx))
            })
            .collect();
        Self { columns }
    }

    fn instance(&self, model: &'static ModelDescriptor, row: &Row) -> Instance {
        let values = row.values();
        let fields = self
            .columns
            .iter()
            .map(|(column, idx)| {
                let value = values.get(*idx).cloned().unwrap_or(Value::Null);
                (column.name.clone(), column.semantic_type.coerce(value))
            })
            .collect();
        Instance {
            model,
            fields,
            related: Vec::new(),
        }
    }

    fn pk_is_null(&self, model: &ModelDescriptor, row: &Row) -> bool {
        let pk = &model.primary_key().name;
        self.columns
            .iter()
            .find(|(column, _)| column.name == *pk)
            .and_then(|(_, idx)| row.values().get(*idx))
            .map_or(true, Value::is_null)
    }
}

/// Materializes full model rows, attaching forward relations loaded by join.
pub(crate) fn instances(
    model: &'static ModelDescriptor,
    forward: &[&'static RelationDef],
    set: &RowSet,
) -> Vec<Instance> {
    let layout = Layout::new(model, &set.columns, None);
    let joined: Vec<(&'static RelationDef, Layout)> = forward
        .iter()
        .filter(|relation| relation.cardinality.is_forward())
        .map(|relation| (*relation, Layout::new(relation.target(), &set.columns, Some(*relation))))
        .collect();

    set.rows
        .iter()
        .map(|row| {
            let mut instance = layout.instance(model, row);
            for (relation, related_layout) in &joined {
                let target = relation.target();
                let nested = if related_layout.pk_is_null(target, row) {
                    None
                } else {
                    Some(Box::new(related_layout.instance(target, row)))
                };
                instance.related.push((relation.name.clone(), Related::One(nested)));
            }
            instance
        })
        .collect()
}

/// Returns the distinct non-null primary keys of `parents`, in order.
pub(crate) fn parent_keys(parents: &[Instance]) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    parents
        .iter()
        .filter_map(Instance::pk)
        .filter(|pk| !pk.is_null() && seen.insert(key_of(pk)))
        .cloned()
        .collect()
}

fn key_of(value: &Value) -> String {
    format!("{value:?}")
}

/// Stitches the rows of a supplemental one-to-many query onto their parents.
pub(crate) fn attach_many(
    parents: &mut [Instance],
    relation: &'static RelationDef,
    set: &RowSet,
) -> StrataResult<()> {
    let target = relation.target();
    let join = relation.remote_join_column()?;
    let children = instances(target, &[], set);

    let mut by_parent: HashMap<String, Vec<Instance>> = HashMap::new();
    for child in children {
        if let Some(key) = child.value(&join.name).filter(|v| !v.is_null()) {
            by_parent.entry(key_of(key)).or_default().push(child);
        }
    }

    for parent in parents.iter_mut() {
        let loaded = parent
            .pk()
            .and_then(|pk| by_parent.get(&key_of(pk)))
            .cloned()
            .unwrap_or_default();
        parent.related.push((relation.name.clone(), Related::Many(loaded)));
    }
    Ok(())
}

/// Attaches an empty one-to-many relation to every parent.
pub(crate) fn attach_empty(parents: &mut [Instance], relation: &'static RelationDef) {
    for parent in parents.iter_mut() {
        parent
            .related
            .push((relation.name.clone(), Related::Many(Vec::new())));
    }
}

/// Returns the semantic type of an aggregate's result.
pub(crate) fn aggregate_type(aggregate: &BoundAggregate) -> SemanticType {
    match (aggregate.func, aggregate.column) {
        (AggregateFunc::Count, _) => SemanticType::Integer,
        (AggregateFunc::Avg, _) => SemanticType::Float,
        (_, Some(column)) => column.semantic_type,
        (_, None) => SemanticType::Integer,
    }
}

/// Materializes `values()` rows.
pub(crate) fn records(
    columns: &[&'static ColumnDef],
    annotations: &[BoundAggregate],
    set: &RowSet,
) -> Vec<Record> {
    set.rows
        .iter()
        .map(|row| {
            let mut values = row.values().iter().cloned();
            let mut record = Record::new();
            for column in columns {
                let value = values.next().unwrap_or(Value::Null);
                record.push(column.name.clone(), column.semantic_type.coerce(value));
            }
            for annotation in annotations {
                let value = values.next().unwrap_or(Value::Null);
                record.push(annotation.alias.clone(), aggregate_value(annotation, value));
            }
            record
        })
        .collect()
}

/// Materializes flat `values_list()` rows.
pub(crate) fn scalars(column: &'static ColumnDef, set: &RowSet) -> Vec<Value> {
    set.rows
        .iter()
        .map(|row| {
            let value = row.values().first().cloned().unwrap_or(Value::Null);
            column.semantic_type.coerce(value)
        })
        .collect()
}

fn aggregate_value(aggregate: &BoundAggregate, value: Value) -> Value {
    match (aggregate.func, value) {
        (AggregateFunc::Count, Value::Null) => Value::Int(0),
        (_, value) => aggregate_type(aggregate).coerce(value),
    }
}

/// Materializes the single row of an `aggregate()` call.
///
/// An empty set yields `0` for `Count` and `Null` for every other function.
pub(crate) fn aggregate_record(aggregates: &[BoundAggregate], set: &RowSet) -> Record {
    let row = set.rows.first();
    aggregates
        .iter()
        .enumerate()
        .map(|(idx, aggregate)| {
            let raw = row
                .and_then(|r| r.values().get(idx))
                .cloned()
                .unwrap_or(Value::Null);
            (aggregate.alias.clone(), aggregate_value(aggregate, raw))
        })
        .collect()
}

/// Materializes rows of a raw statement by column name.
///
/// `translations` maps result column names to model field names.
pub(crate) fn raw_instances(
    model: &'static ModelDescriptor,
    translations: &[(String, String)],
    set: &RowSet,
) -> Vec<Instance> {
    let names: Vec<String> = set
        .columns
        .iter()
        .map(|name| {
            translations
                .iter()
                .find(|(from, _)| from == name)
                .map_or_else(|| name.clone(), |(_, to)| to.clone())
        })
        .collect();
    let layout = Layout::new(model, &names, None);
    set.rows.iter().map(|row| layout.instance(model, row)).collect()
}
