//! Dynamic column values.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeErrorKind, Error};

/// A dynamically-typed column value.
///
/// One variant per server type the decoder understands. Values are produced
/// by decoding a single column of a single row and are used for typed
/// access through [`FromValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// 64-bit signed integer (int8)
    BigInt(i64),

    /// Boolean value
    Bool(bool),

    /// 64-bit floating point (float8)
    Double(f64),

    /// 32-bit signed integer (int4)
    Int(i32),

    /// 32-bit floating point (float4)
    Float(f32),

    /// 16-bit signed integer (int2)
    SmallInt(i16),

    /// Text string (text, varchar, bpchar, char)
    Text(String),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::BigInt(_) => "BIGINT",
            Value::Bool(_) => "BOOLEAN",
            Value::Double(_) => "DOUBLE",
            Value::Int(_) => "INTEGER",
            Value::Float(_) => "REAL",
            Value::SmallInt(_) => "SMALLINT",
            Value::Text(_) => "TEXT",
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Extract a typed value, failing with `TypeMismatch` if the variant
    /// does not match `T` exactly.
    pub fn get<T: FromValue>(&self) -> crate::Result<T> {
        T::from_value(self)
    }

    /// Consume the value, extracting the typed payload.
    pub fn into_typed<T: FromValue>(self) -> crate::Result<T> {
        T::from_owned(self)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Trait for converting from a `Value` to a typed value.
///
/// Conversions are exact: an `i64` can only be read from `Value::BigInt`,
/// never widened from a smaller integer. Use `Option<T>` to accept NULL.
pub trait FromValue: Sized {
    /// SQL-ish name of the expected variant, used in error messages.
    const EXPECTED: &'static str;

    /// Convert from a borrowed Value.
    fn from_value(value: &Value) -> crate::Result<Self>;

    /// Convert from an owned Value. Override to avoid clones.
    fn from_owned(value: Value) -> crate::Result<Self> {
        Self::from_value(&value)
    }
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::Decode(DecodeError {
        kind: DecodeErrorKind::TypeMismatch,
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

macro_rules! impl_from_value_copy {
    ($ty:ty, $variant:ident, $expected:literal) => {
        impl FromValue for $ty {
            const EXPECTED: &'static str = $expected;

            fn from_value(value: &Value) -> crate::Result<Self> {
                match value {
                    Value::$variant(v) => Ok(*v),
                    other => Err(mismatch(Self::EXPECTED, other)),
                }
            }
        }
    };
}

impl_from_value_copy!(i64, BigInt, "BIGINT");
impl_from_value_copy!(bool, Bool, "BOOLEAN");
impl_from_value_copy!(f64, Double, "DOUBLE");
impl_from_value_copy!(i32, Int, "INTEGER");
impl_from_value_copy!(f32, Float, "REAL");
impl_from_value_copy!(i16, SmallInt, "SMALLINT");

impl FromValue for String {
    const EXPECTED: &'static str = "TEXT";

    fn from_value(value: &Value) -> crate::Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch(Self::EXPECTED, other)),
        }
    }

    fn from_owned(value: Value) -> crate::Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(mismatch(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for Value {
    const EXPECTED: &'static str = "any";

    fn from_value(value: &Value) -> crate::Result<Self> {
        Ok(value.clone())
    }

    fn from_owned(value: Value) -> crate::Result<Self> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: &Value) -> crate::Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }

    fn from_owned(value: Value) -> crate::Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_owned(v).map(Some),
        }
    }
}
