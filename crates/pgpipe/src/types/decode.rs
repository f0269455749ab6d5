//! Column decoding (PostgreSQL text format → `Value`).
//!
//! Results arrive in text format. The column's type OID selects the
//! `Value` variant; the text is then parsed for that type.

use pgpipe_core::error::{DecodeError, DecodeErrorKind};
use pgpipe_core::{Error, Result, Value};

use super::oid;

/// Decode a value from PostgreSQL text format.
pub trait TextDecode: Sized {
    /// Decode from a PostgreSQL text representation.
    fn decode_text(s: &str) -> Result<Self>;
}

// ==================== Boolean ====================

impl TextDecode for bool {
    fn decode_text(s: &str) -> Result<Self> {
        match s {
            "t" | "true" => Ok(true),
            "f" | "false" => Ok(false),
            _ => Err(malformed("bool", s)),
        }
    }
}

// ==================== Integers ====================

impl TextDecode for i16 {
    fn decode_text(s: &str) -> Result<Self> {
        s.parse().map_err(|_| malformed("int2", s))
    }
}

impl TextDecode for i32 {
    fn decode_text(s: &str) -> Result<Self> {
        s.parse().map_err(|_| malformed("int4", s))
    }
}

impl TextDecode for i64 {
    fn decode_text(s: &str) -> Result<Self> {
        s.parse().map_err(|_| malformed("int8", s))
    }
}

// ==================== Floating Point ====================

impl TextDecode for f32 {
    fn decode_text(s: &str) -> Result<Self> {
        match s {
            "NaN" => Ok(f32::NAN),
            "Infinity" => Ok(f32::INFINITY),
            "-Infinity" => Ok(f32::NEG_INFINITY),
            _ => s.parse().map_err(|_| malformed("float4", s)),
        }
    }
}

impl TextDecode for f64 {
    fn decode_text(s: &str) -> Result<Self> {
        match s {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            _ => s.parse().map_err(|_| malformed("float8", s)),
        }
    }
}

/// Decode one column value.
///
/// `None` (SQL NULL) decodes to `Value::Null` whatever the type; any OID
/// outside the supported scalar set is an `UnsupportedType` error.
pub fn decode_value(type_oid: u32, text: Option<&str>) -> Result<Value> {
    let Some(s) = text else {
        return Ok(Value::Null);
    };

    match type_oid {
        oid::INT8 => Ok(Value::BigInt(i64::decode_text(s)?)),
        oid::BOOL => Ok(Value::Bool(bool::decode_text(s)?)),
        oid::FLOAT8 => Ok(Value::Double(f64::decode_text(s)?)),
        oid::INT4 => Ok(Value::Int(i32::decode_text(s)?)),
        oid::FLOAT4 => Ok(Value::Float(f32::decode_text(s)?)),
        oid::INT2 => Ok(Value::SmallInt(i16::decode_text(s)?)),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::CHAR => Ok(Value::Text(s.to_string())),
        other => Err(Error::Decode(DecodeError {
            kind: DecodeErrorKind::UnsupportedType,
            expected: "a supported column type",
            actual: format!("{} (oid {})", oid::type_name(other), other),
            column: None,
        })),
    }
}

fn malformed(expected: &'static str, value: &str) -> Error {
    Error::Decode(DecodeError {
        kind: DecodeErrorKind::Malformed,
        expected,
        actual: format!("invalid value: {}", value),
        column: None,
    })
}
