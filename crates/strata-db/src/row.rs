//! Result rows and typed value extraction.

use std::sync::Arc;

use strata_core::{StrataError, StrataResult};

use crate::value::Value;

/// One row returned by a connection.
///
/// Column names are shared between all rows of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from shared column names and its values.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Gets a typed value by column name.
    pub fn get<T: FromValue>(&self, column: &str) -> StrataResult<T> {
        let value = self.get_value(column).ok_or_else(|| {
            StrataError::DatabaseError(format!("Column '{column}' not found in row"))
        })?;
        T::from_value(value)
    }

    /// Gets a typed value by column index.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> StrataResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            StrataError::DatabaseError(format!(
                "Column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Returns the raw value of a column.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }
}

/// Conversion from a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> StrataResult<Self>;
}

fn mismatch(expected: &str, value: &Value) -> StrataError {
    StrataError::DatabaseError(format!("Expected {expected}, got {value:?}"))
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> StrataResult<Self> {
        value.as_int().ok_or_else(|| mismatch("Int", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> StrataResult<Self> {
        let wide = value.as_int().ok_or_else(|| mismatch("Int", value))?;
        i32::try_from(wide).map_err(|e| {
            StrataError::DatabaseError(format!("Int value out of i32 range: {e}"))
        })
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> StrataResult<Self> {
        value.as_float().ok_or_else(|| mismatch("Float", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> StrataResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => Err(mismatch("Bool", value)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> StrataResult<Self> {
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| mismatch("String", value))
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> StrataResult<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            _ => Err(mismatch("Bytes", value)),
        }
    }
}

impl FromValue for chrono::NaiveDate {
    fn from_value(value: &Value) -> StrataResult<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            _ => Err(mismatch("Date", value)),
        }
    }
}

impl FromValue for chrono::NaiveDateTime {
    fn from_value(value: &Value) -> StrataResult<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            _ => Err(mismatch("DateTime", value)),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> StrataResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            _ => Err(mismatch("Uuid", value)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> StrataResult<Self> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            _ => Err(mismatch("Json", value)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> StrataResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> StrataResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new(
            Arc::from(vec!["id".to_string(), "name".to_string(), "bio".to_string()]),
            vec![Value::Int(7), Value::from("Ada"), Value::Null],
        )
    }

    #[test]
    fn test_get_by_name() {
        let r = row();
        assert_eq!(r.get::<i64>("id").unwrap(), 7);
        assert_eq!(r.get::<i32>("id").unwrap(), 7);
        assert_eq!(r.get::<String>("name").unwrap(), "Ada");
        assert_eq!(r.get::<Option<String>>("bio").unwrap(), None);
        assert!(r.get::<i64>("missing").is_err());
        assert!(r.get::<i64>("name").is_err());
    }

    #[test]
    fn test_get_by_index() {
        let r = row();
        assert_eq!(r.get_by_index::<String>(1).unwrap(), "Ada");
        assert!(r.get_by_index::<String>(5).is_err());
        assert_eq!(r.len(), 3);
        assert!(!r.is_empty());
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(f64::from_value(&Value::Int(2)).unwrap(), 2.0);
        assert!(bool::from_value(&Value::Int(1)).unwrap());
        assert!(i32::from_value(&Value::Int(i64::MAX)).is_err());
    }

    #[test]
    fn test_get_value() {
        let r = row();
        assert_eq!(r.get_value("bio"), Some(&Value::Null));
        assert_eq!(r.get_value("nope"), None);
        assert_eq!(r.columns(), ["id", "name", "bio"]);
    }
}
