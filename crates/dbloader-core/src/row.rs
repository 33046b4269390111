//! Result rows and typed column access.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::sync::Arc;

/// One row of a result set.
///
/// The column list is shared by every row of the same result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len(), "row width mismatch");
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The raw value of `column`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let pos = self.columns.iter().position(|name| name == column)?;
        self.values.get(pos)
    }

    /// The value of `column`, decoded as `T`.
    ///
    /// A missing column or a value of the wrong shape is an [`Error::Type`]
    /// naming the column.
    #[allow(clippy::result_large_err)]
    pub fn get_named<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.get(column).ok_or_else(|| TypeError {
            expected: std::any::type_name::<T>(),
            actual: "no such column".to_string(),
            column: Some(column.to_string()),
        })?;
        T::from_value(value).map_err(|mut err| {
            err.column = Some(column.to_string());
            Error::Type(err)
        })
    }
}

/// Decoding of a single cell.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> std::result::Result<Self, TypeError>;
}

fn mismatch(expected: &'static str, value: &Value) -> TypeError {
    TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> std::result::Result<Self, TypeError> {
        match value {
            Value::Bool(v) => Ok(*v),
            _ => value
                .as_i64()
                .map(|v| v != 0)
                .ok_or_else(|| mismatch("bool", value)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> std::result::Result<Self, TypeError> {
        let wide = value.as_i64().ok_or_else(|| mismatch("i32", value))?;
        i32::try_from(wide).map_err(|_| TypeError {
            expected: "i32",
            actual: format!("{wide} (out of range)"),
            column: None,
        })
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> std::result::Result<Self, TypeError> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> std::result::Result<Self, TypeError> {
        match value {
            Value::Text(text) => Ok(text.clone()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromValue for [u8; 16] {
    fn from_value(value: &Value) -> std::result::Result<Self, TypeError> {
        match value {
            Value::Uuid(bytes) => Ok(*bytes),
            _ => Err(mismatch("UUID", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> std::result::Result<Self, TypeError> {
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(value).map(Some)
    }
}
