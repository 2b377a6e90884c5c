//! Model descriptors and the [`Model`] trait.
//!
//! A [`ModelDescriptor`] is the engine's only view of a table: its name, its
//! ordered columns with their semantic types, and its declared relations.
//! Descriptors are built once and then shared as `&'static` references, so
//! models usually keep theirs in a `static LazyLock`.
//!
//! Every relation declares its [`Cardinality`]. The compiler never infers
//! fan-out: a `OneToMany` relation is always eager-loaded with a separate
//! keyed query, a `ManyToOne`/`OneToOne` relation with an outer join.

use std::collections::HashSet;
use std::fmt;

use strata_core::{StrataError, StrataResult};

use crate::query::materialize::Instance;
use crate::query::queryset::Manager;
use crate::value::Value;

/// The semantic type of a column, which decides which lookups it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticType {
    /// A signed integer.
    Integer,
    /// A floating-point number.
    Float,
    /// Text.
    Text,
    /// A boolean flag.
    Boolean,
    /// A calendar date.
    Date,
    /// A date and time without timezone.
    DateTime,
    /// A UUID.
    Uuid,
    /// A JSON document.
    Json,
    /// Raw bytes.
    Bytes,
}

impl SemanticType {
    /// Returns `true` for types that `Sum` and `Avg` can aggregate.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Returns `true` for types with a meaningful ordering (`gt`, `Min`, ...).
    pub const fn is_ordered(self) -> bool {
        matches!(
            self,
            Self::Integer | Self::Float | Self::Text | Self::Date | Self::DateTime
        )
    }

    /// Returns `true` if `value` is a valid non-null value of this type.
    pub const fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Integer, Value::Int(_))
                | (Self::Float, Value::Float(_) | Value::Int(_))
                | (Self::Text, Value::String(_))
                | (Self::Boolean, Value::Bool(_))
                | (Self::Date, Value::Date(_))
                | (Self::DateTime, Value::DateTime(_))
                | (Self::Uuid, Value::Uuid(_))
                | (Self::Json, Value::Json(_))
                | (Self::Bytes, Value::Bytes(_))
        )
    }

    /// Converts a value into this type's canonical variant where possible.
    ///
    /// Stores differ in how they hand values back: `SQLite` has no boolean or
    /// date types, `MySQL` returns text and decimals as bytes. Values that
    /// cannot be converted are returned unchanged.
    pub fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (Self::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (Self::Boolean, Value::String(s)) => match s.to_lowercase().as_str() {
                "t" | "true" | "1" => Value::Bool(true),
                "f" | "false" | "0" => Value::Bool(false),
                _ => Value::String(s),
            },
            (Self::Integer, Value::String(s)) => {
                s.trim().parse().map_or(Value::String(s), Value::Int)
            }
            (Self::Float, Value::Int(i)) => Value::Float(i as f64),
            (Self::Float, Value::String(s)) => {
                s.trim().parse().map_or(Value::String(s), Value::Float)
            }
            (Self::Date, Value::String(s)) => {
                chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_or(Value::String(s), Value::Date)
            }
            (Self::Date, Value::DateTime(dt)) => Value::Date(dt.date()),
            (Self::DateTime, Value::String(s)) => {
                parse_datetime(s.trim()).map_or(Value::String(s), Value::DateTime)
            }
            (Self::DateTime, Value::Date(d)) => {
                Value::DateTime(d.and_time(chrono::NaiveTime::MIN))
            }
            (Self::Uuid, Value::String(s)) => {
                uuid::Uuid::parse_str(s.trim()).map_or(Value::String(s), Value::Uuid)
            }
            (Self::Uuid, Value::Bytes(b)) => {
                uuid::Uuid::from_slice(&b).map_or(Value::Bytes(b), Value::Uuid)
            }
            (Self::Json, Value::String(s)) => {
                serde_json::from_str(&s).map_or(Value::String(s), Value::Json)
            }
            (Self::Bytes, Value::String(s)) => Value::Bytes(s.into_bytes()),
            (ty, Value::Bytes(b)) if ty != Self::Bytes => match String::from_utf8(b) {
                Ok(s) => ty.coerce(Value::String(s)),
                Err(e) => Value::Bytes(e.into_bytes()),
            },
            (_, other) => other,
        }
    }
}

fn parse_datetime(s: &str) -> Option<chrono::NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Uuid => "uuid",
            Self::Json => "json",
            Self::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A column of a model's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// The column name.
    pub name: String,
    /// The semantic type.
    pub semantic_type: SemanticType,
    /// Whether this column is the primary key.
    pub primary_key: bool,
    /// Whether the column may hold NULL.
    pub nullable: bool,
}

impl ColumnDef {
    /// Creates a non-nullable, non-key column.
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            primary_key: false,
            nullable: false,
        }
    }

    /// Marks the column as the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Marks the column as nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// How many rows sit on each side of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// This table holds the join column, pointing at the target's primary key.
    ManyToOne,
    /// Like `ManyToOne`, but the join column is unique.
    OneToOne,
    /// The target table holds the join column, pointing at this table's
    /// primary key. Joining would duplicate rows of this table.
    OneToMany,
}

impl Cardinality {
    /// Returns `true` if the join column lives on the declaring table.
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::ManyToOne | Self::OneToOne)
    }
}

/// A declared relation to another model.
#[derive(Clone)]
pub struct RelationDef {
    /// The relation name used in lookups (`author__email`) and `select_related`.
    pub name: String,
    /// Returns the descriptor of the related model.
    pub target: fn() -> &'static ModelDescriptor,
    /// The declared cardinality.
    pub cardinality: Cardinality,
    /// The join column: on this table for forward relations, on the target
    /// table for `OneToMany`.
    pub join_column: String,
}

impl RelationDef {
    /// Declares a many-to-one relation whose join column lives on this table.
    pub fn many_to_one(
        name: impl Into<String>,
        target: fn() -> &'static ModelDescriptor,
        join_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            cardinality: Cardinality::ManyToOne,
            join_column: join_column.into(),
        }
    }

    /// Declares a one-to-one relation whose join column lives on this table.
    pub fn one_to_one(
        name: impl Into<String>,
        target: fn() -> &'static ModelDescriptor,
        join_column: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::OneToOne,
            ..Self::many_to_one(name, target, join_column)
        }
    }

    /// Declares a one-to-many relation whose join column lives on the target.
    pub fn one_to_many(
        name: impl Into<String>,
        target: fn() -> &'static ModelDescriptor,
        join_column: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::OneToMany,
            ..Self::many_to_one(name, target, join_column)
        }
    }

    /// Returns the related model's descriptor.
    pub fn target(&self) -> &'static ModelDescriptor {
        (self.target)()
    }

    /// Resolves the join column on the target table of a `OneToMany` relation.
    pub(crate) fn remote_join_column(&self) -> StrataResult<&'static ColumnDef> {
        let target = self.target();
        target
            .column(&self.join_column)
            .ok_or_else(|| StrataError::UnknownField {
                model: target.table_name().to_string(),
                field: self.join_column.clone(),
            })
    }
}

impl fmt::Debug for RelationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationDef")
            .field("name", &self.name)
            .field("cardinality", &self.cardinality)
            .field("join_column", &self.join_column)
            .finish_non_exhaustive()
    }
}

/// The static description of a model's table.
///
/// # Examples
///
/// ```
/// use strata_db::model::{ColumnDef, ModelDescriptor, SemanticType};
///
/// let users = ModelDescriptor::builder("users")
///     .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
///     .column(ColumnDef::new("email", SemanticType::Text))
///     .column(ColumnDef::new("is_active", SemanticType::Boolean))
///     .build()
///     .unwrap();
///
/// assert_eq!(users.table_name(), "users");
/// assert_eq!(users.primary_key().name, "id");
/// assert_eq!(users.columns().len(), 3);
/// ```
#[derive(Debug)]
pub struct ModelDescriptor {
    table_name: String,
    columns: Vec<ColumnDef>,
    relations: Vec<RelationDef>,
    primary_key: usize,
}

impl ModelDescriptor {
    /// Starts building a descriptor for `table_name`.
    pub fn builder(table_name: impl Into<String>) -> ModelDescriptorBuilder {
        ModelDescriptorBuilder {
            table_name: table_name.into(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Returns the table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Returns the columns in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Returns the declared relations.
    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    /// Returns the primary key column.
    pub fn primary_key(&self) -> &ColumnDef {
        &self.columns[self.primary_key]
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Looks up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Looks up a column, failing with `UnknownField`.
    pub fn require_column(&self, name: &str) -> StrataResult<&ColumnDef> {
        self.column(name).ok_or_else(|| StrataError::UnknownField {
            model: self.table_name.clone(),
            field: name.to_string(),
        })
    }

    /// Looks up a relation, failing with `UnknownRelation`.
    pub fn require_relation(&self, name: &str) -> StrataResult<&RelationDef> {
        self.relation(name).ok_or_else(|| StrataError::UnknownRelation {
            model: self.table_name.clone(),
            relation: name.to_string(),
        })
    }
}

/// Builder for [`ModelDescriptor`].
#[derive(Debug)]
pub struct ModelDescriptorBuilder {
    table_name: String,
    columns: Vec<ColumnDef>,
    relations: Vec<RelationDef>,
}

impl ModelDescriptorBuilder {
    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Appends a relation.
    #[must_use]
    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    /// Validates and builds the descriptor.
    ///
    /// Fails if there is not exactly one primary key, if column or relation
    /// names repeat, if a relation name shadows a column, or if a forward
    /// relation's join column is not a column of this table.
    pub fn build(self) -> StrataResult<ModelDescriptor> {
        let invalid = |msg: String| {
            StrataError::ConfigurationError(format!("model '{}': {msg}", self.table_name))
        };

        let keys: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect();
        let primary_key = match keys.as_slice() {
            [only] => *only,
            [] => return Err(invalid("no primary key column".to_string())),
            _ => return Err(invalid("more than one primary key column".to_string())),
        };

        let mut names = HashSet::new();
        for column in &self.columns {
            if column.name.contains("__") {
                return Err(invalid(format!("column name '{}' contains '__'", column.name)));
            }
            if !names.insert(column.name.as_str()) {
                return Err(invalid(format!("duplicate column '{}'", column.name)));
            }
        }
        for relation in &self.relations {
            if !names.insert(relation.name.as_str()) {
                return Err(invalid(format!(
                    "relation '{}' collides with another field",
                    relation.name
                )));
            }
            if relation.cardinality.is_forward()
                && !self.columns.iter().any(|c| c.name == relation.join_column)
            {
                return Err(invalid(format!(
                    "join column '{}' of relation '{}' is not a column",
                    relation.join_column, relation.name
                )));
            }
        }

        Ok(ModelDescriptor {
            table_name: self.table_name,
            columns: self.columns,
            relations: self.relations,
            primary_key,
        })
    }
}

/// A typed model backed by a [`ModelDescriptor`].
///
/// # Examples
///
/// ```
/// use std::sync::LazyLock;
/// use strata_db::model::{ColumnDef, Model, ModelDescriptor, SemanticType};
/// use strata_db::query::Instance;
/// use strata_core::StrataResult;
///
/// struct Tag {
///     id: i64,
///     label: String,
/// }
///
/// static TAGS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
///     ModelDescriptor::builder("tags")
///         .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
///         .column(ColumnDef::new("label", SemanticType::Text))
///         .build()
///         .expect("valid descriptor")
/// });
///
/// impl Model for Tag {
///     fn descriptor() -> &'static ModelDescriptor {
///         &TAGS
///     }
///
///     fn from_instance(instance: &Instance) -> StrataResult<Self> {
///         Ok(Self {
///             id: instance.get("id")?,
///             label: instance.get("label")?,
///         })
///     }
/// }
///
/// let sql = Tag::objects()
///     .all()
///     .to_sql(strata_db::DatabaseBackendType::SQLite);
/// assert!(sql.starts_with("SELECT"));
/// ```
pub trait Model: Sized + Send + 'static {
    /// Returns the static descriptor of this model's table.
    fn descriptor() -> &'static ModelDescriptor;

    /// Builds a typed value from a materialized row.
    fn from_instance(instance: &Instance) -> StrataResult<Self>;

    /// Returns the manager through which queries on this model start.
    fn objects() -> Manager<Self> {
        Manager::new()
    }
}
