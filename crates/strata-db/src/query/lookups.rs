//! Field lookups: the `field__operator` keyword syntax.
//!
//! [`parse`] turns a key such as `"author__email__icontains"` and its value
//! into a validated [`Condition`]. Validation is eager and complete: once a
//! condition exists, the compiler can render it for any dialect without
//! failing.
//!
//! # Examples
//!
//! ```
//! use std::sync::LazyLock;
//! use strata_db::model::{ColumnDef, ModelDescriptor, SemanticType};
//! use strata_db::query::lookups::{parse, LookupKind};
//! use strata_db::value::Value;
//!
//! static USERS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
//!     ModelDescriptor::builder("users")
//!         .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
//!         .column(ColumnDef::new("age", SemanticType::Integer))
//!         .column(ColumnDef::new("is_active", SemanticType::Boolean))
//!         .build()
//!         .unwrap()
//! });
//!
//! let cond = parse("age__gte", Value::from(18), &USERS).unwrap();
//! assert_eq!(cond.operator(), LookupKind::Gte);
//! assert_eq!(cond.field().to_string(), "age");
//!
//! // `exact` is the default operator.
//! let cond = parse("is_active", Value::from(true), &USERS).unwrap();
//! assert_eq!(cond.operator(), LookupKind::Exact);
//!
//! // Ordering lookups make no sense on a boolean.
//! assert!(parse("is_active__gte", Value::from(true), &USERS).is_err());
//! ```

use std::fmt;

use strata_core::{StrataError, StrataResult};

use crate::model::{Cardinality, ColumnDef, ModelDescriptor, RelationDef, SemanticType};
use crate::value::Value;

/// The closed set of lookup operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    /// `field = value` (`IS NULL` when the value is null).
    Exact,
    /// Case-insensitive equality.
    IExact,
    /// `field > value`.
    Gt,
    /// `field >= value`.
    Gte,
    /// `field < value`.
    Lt,
    /// `field <= value`.
    Lte,
    /// Case-sensitive substring match.
    Contains,
    /// Case-insensitive substring match.
    IContains,
    /// Case-sensitive prefix match.
    StartsWith,
    /// Case-insensitive prefix match.
    IStartsWith,
    /// Case-sensitive suffix match.
    EndsWith,
    /// Case-insensitive suffix match.
    IEndsWith,
    /// Membership in a list.
    In,
    /// `IS NULL` / `IS NOT NULL`.
    IsNull,
    /// Inclusive range between two values.
    Range,
}

impl LookupKind {
    /// Every lookup kind, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::Exact,
        Self::IExact,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::Contains,
        Self::IContains,
        Self::StartsWith,
        Self::IStartsWith,
        Self::EndsWith,
        Self::IEndsWith,
        Self::In,
        Self::IsNull,
        Self::Range,
    ];

    /// Parses a lookup name as written after `__`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Returns the lookup name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::IExact => "iexact",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::In => "in",
            Self::IsNull => "isnull",
            Self::Range => "range",
        }
    }

    /// Returns `true` for the case-folding lookups.
    pub const fn is_case_insensitive(self) -> bool {
        matches!(
            self,
            Self::IExact | Self::IContains | Self::IStartsWith | Self::IEndsWith
        )
    }

    /// Returns `true` for the substring/prefix/suffix lookups.
    pub const fn is_pattern(self) -> bool {
        matches!(
            self,
            Self::Contains
                | Self::IContains
                | Self::StartsWith
                | Self::IStartsWith
                | Self::EndsWith
                | Self::IEndsWith
        )
    }

    /// Returns `true` if this lookup may be applied to a column of type `ty`.
    pub const fn is_valid_for(self, ty: SemanticType) -> bool {
        match ty {
            SemanticType::Text => true,
            SemanticType::Integer
            | SemanticType::Float
            | SemanticType::Date
            | SemanticType::DateTime => matches!(
                self,
                Self::Exact
                    | Self::Gt
                    | Self::Gte
                    | Self::Lt
                    | Self::Lte
                    | Self::In
                    | Self::Range
                    | Self::IsNull
            ),
            SemanticType::Boolean | SemanticType::Uuid => {
                matches!(self, Self::Exact | Self::In | Self::IsNull)
            }
            SemanticType::Json | SemanticType::Bytes => {
                matches!(self, Self::Exact | Self::IsNull)
            }
        }
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved field path: a local column, or a column one relation away.
#[derive(Debug, Clone, Copy)]
pub enum FieldPath {
    /// A column of the queried model.
    Column(&'static ColumnDef),
    /// A column of a related model.
    Related {
        /// The traversed relation.
        relation: &'static RelationDef,
        /// The column on the relation's target.
        column: &'static ColumnDef,
    },
}

impl FieldPath {
    /// Returns the column the condition is evaluated against.
    pub const fn column(&self) -> &'static ColumnDef {
        match self {
            Self::Column(column) | Self::Related { column, .. } => *column,
        }
    }

    /// Returns the traversed relation, if any.
    pub const fn relation(&self) -> Option<&'static RelationDef> {
        match self {
            Self::Column(_) => None,
            Self::Related { relation, .. } => Some(*relation),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(column) => f.write_str(&column.name),
            Self::Related { relation, column } => write!(f, "{}.{}", relation.name, column.name),
        }
    }
}

/// One validated filter condition.
///
/// Conditions are created by [`parse`] and by the `filter`/`exclude` methods
/// of a query set; their fields cannot be set from outside the crate.
#[derive(Debug, Clone)]
pub struct Condition {
    field: FieldPath,
    operator: LookupKind,
    value: Value,
    negated: bool,
}

impl Condition {
    /// Returns the resolved field path.
    pub const fn field(&self) -> &FieldPath {
        &self.field
    }

    /// Returns the lookup operator.
    pub const fn operator(&self) -> LookupKind {
        self.operator
    }

    /// Returns the (coerced) lookup argument.
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Returns `true` for conditions added through `exclude`.
    pub const fn is_negated(&self) -> bool {
        self.negated
    }

    /// Returns this condition with its negation flag set.
    #[must_use]
    pub(crate) fn negate(mut self) -> Self {
        self.negated = true;
        self
    }
}

/// Parses a `field__operator` key and its value against `model`.
///
/// The key is split on `__`. If the last segment names a [`LookupKind`], it
/// is the operator and the segments before it are the field path; otherwise
/// the operator is `exact` and the whole key is the path.
pub fn parse(key: &str, value: Value, model: &'static ModelDescriptor) -> StrataResult<Condition> {
    let segments: Vec<&str> = key.split("__").collect();
    let (path, operator) = match segments.split_last() {
        Some((last, rest)) if !rest.is_empty() => match LookupKind::from_name(last) {
            Some(kind) => (rest, kind),
            None => (segments.as_slice(), LookupKind::Exact),
        },
        _ => (segments.as_slice(), LookupKind::Exact),
    };

    let field = match resolve_path(path, model) {
        Some(field) => field,
        None => return Err(unresolved(&segments, operator, model)),
    };

    let column = field.column();
    if !operator.is_valid_for(column.semantic_type) {
        return Err(StrataError::InvalidLookup {
            field: field.to_string(),
            lookup: operator.to_string(),
            reason: format!("not supported on {} columns", column.semantic_type),
        });
    }

    let value = check_argument(&field, operator, value)?;
    Ok(Condition {
        field,
        operator,
        value,
        negated: false,
    })
}

/// Resolves a field path of one or two segments.
pub(crate) fn resolve_path(
    path: &[&str],
    model: &'static ModelDescriptor,
) -> Option<FieldPath> {
    match path {
        [name] => {
            if let Some(column) = model.column(name) {
                return Some(FieldPath::Column(column));
            }
            let relation = model.relation(name)?;
            match relation.cardinality {
                Cardinality::ManyToOne | Cardinality::OneToOne => {
                    model.column(&relation.join_column).map(FieldPath::Column)
                }
                Cardinality::OneToMany => Some(FieldPath::Related {
                    relation,
                    column: relation.target().primary_key(),
                }),
            }
        }
        [relation, column] => {
            let relation = model.relation(relation)?;
            let column = relation.target().column(column)?;
            if relation.cardinality == Cardinality::OneToMany {
                relation.remote_join_column().ok()?;
            }
            Some(FieldPath::Related { relation, column })
        }
        _ => None,
    }
}

/// Builds the error for a key whose path does not resolve.
///
/// `age__foo` on a model with an `age` column is a bad lookup name rather
/// than a bad field.
fn unresolved(segments: &[&str], operator: LookupKind, model: &'static ModelDescriptor) -> StrataError {
    if operator == LookupKind::Exact {
        if let Some((last, rest)) = segments.split_last() {
            if !rest.is_empty() && resolve_path(rest, model).is_some() {
                return StrataError::InvalidLookup {
                    field: rest.join("__"),
                    lookup: (*last).to_string(),
                    reason: "unknown lookup".to_string(),
                };
            }
        }
    }
    let path_len = if operator == LookupKind::Exact && !segments.ends_with(&["exact"]) {
        segments.len()
    } else {
        segments.len() - 1
    };
    StrataError::UnknownField {
        model: model.table_name().to_string(),
        field: segments[..path_len].join("__"),
    }
}

/// Checks the argument shape for `operator` and coerces it to the column type.
fn check_argument(field: &FieldPath, operator: LookupKind, value: Value) -> StrataResult<Value> {
    let column = field.column();
    let ty = column.semantic_type;
    let arity = |expected: &str| StrataError::LookupArity {
        field: field.to_string(),
        lookup: operator.to_string(),
        expected: expected.to_string(),
    };
    let scalar = |value: Value| -> StrataResult<Value> {
        let value = ty.coerce(value);
        if ty.accepts(&value) {
            Ok(value)
        } else {
            Err(arity(&format!("a {ty} value, got {value:?}")))
        }
    };

    match operator {
        LookupKind::IsNull => match value {
            Value::Bool(_) => Ok(value),
            _ => Err(arity("a boolean")),
        },
        LookupKind::In => match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| if item.is_null() { Ok(item) } else { scalar(item) })
                .collect::<StrataResult<Vec<_>>>()
                .map(Value::List),
            _ => Err(arity("a list of values")),
        },
        LookupKind::Range => match value {
            Value::List(items) if items.len() == 2 && !items.iter().any(Value::is_null) => items
                .into_iter()
                .map(&scalar)
                .collect::<StrataResult<Vec<_>>>()
                .map(Value::List),
            _ => Err(arity("a list of exactly two non-null values")),
        },
        LookupKind::Exact if value.is_null() => Ok(Value::Null),
        _ => match value {
            Value::List(_) => Err(arity("a single value, not a list")),
            Value::Null => Err(arity("a non-null value")),
            other => scalar(other),
        },
    }
}
