//! Cell and parameter values.

/// One SQL value, as bound into a generated query or read out of a row.
///
/// Only the shapes a cache key or a decoded column can take are modelled;
/// drivers map richer column types onto these before handing rows back.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    /// 16 raw bytes, big-endian.
    Uuid([u8; 16]),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL-ish name of the variant, for type errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Text(_) => "TEXT",
            Value::Uuid(_) => "UUID",
        }
    }

    /// Integer content, widened. Booleans count as 0 or 1.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(
    bool => Bool,
    i32 => Int,
    i64 => BigInt,
    String => Text,
    [u8; 16] => Uuid,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_widen() {
        assert_eq!(Value::Int(5).as_i64(), Some(5));
        assert_eq!(Value::BigInt(i64::MIN).as_i64(), Some(i64::MIN));
        assert_eq!(Value::Bool(true).as_i64(), Some(1));
        assert_eq!(Value::Text("7".into()).as_i64(), None);
    }

    #[test]
    fn options_map_none_to_null() {
        assert!(Value::from(None::<i64>).is_null());
        assert_eq!(Value::from(Some(9_i64)), Value::BigInt(9));
        assert_eq!(Value::from("sku"), Value::Text("sku".into()));
    }

    #[test]
    fn type_names_for_errors() {
        assert_eq!(Value::Null.type_name(), "NULL");
        assert_eq!(Value::Uuid([0; 16]).type_name(), "UUID");
    }
}
