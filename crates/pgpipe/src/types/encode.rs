//! Parameter encoding (Rust → PostgreSQL text format).
//!
//! Every bound parameter travels as text (or as SQL NULL). The server parses
//! it according to the type it inferred for the placeholder at prepare time,
//! so each encoding here must round-trip without loss.

use pgpipe_core::Value;

/// A bound parameter: `None` is SQL NULL.
pub type Param = Option<String>;

/// Encode a value as a text-format query parameter.
///
/// Only types implementing this trait can be passed to
/// [`PgPipeline::query`](crate::PgPipeline::query) or [`params!`](crate::params).
pub trait ToParam {
    /// Encode self, or `None` for NULL.
    fn to_param(&self) -> Param;
}

impl<T: ToParam + ?Sized> ToParam for &T {
    fn to_param(&self) -> Param {
        (**self).to_param()
    }
}

// ==================== Boolean ====================

impl ToParam for bool {
    fn to_param(&self) -> Param {
        Some(if *self { "t" } else { "f" }.to_string())
    }
}

// ==================== Integers ====================

macro_rules! impl_to_param_display {
    ($($ty:ty),*) => {
        $(
            impl ToParam for $ty {
                fn to_param(&self) -> Param {
                    Some(self.to_string())
                }
            }
        )*
    };
}

impl_to_param_display!(i16, i32, i64);

// ==================== Floating Point ====================

impl ToParam for f32 {
    fn to_param(&self) -> Param {
        Some(encode_float(f64::from(*self), self.to_string()))
    }
}

impl ToParam for f64 {
    fn to_param(&self) -> Param {
        Some(encode_float(*self, self.to_string()))
    }
}

/// Rust's `Display` for floats is the shortest round-trip form, but spells
/// the specials differently from PostgreSQL.
fn encode_float(v: f64, display: String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v.is_sign_positive() {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else {
        display
    }
}

// ==================== Strings ====================

impl ToParam for str {
    fn to_param(&self) -> Param {
        Some(self.to_string())
    }
}

impl ToParam for String {
    fn to_param(&self) -> Param {
        Some(self.clone())
    }
}

// ==================== Optional ====================

impl<T: ToParam> ToParam for Option<T> {
    fn to_param(&self) -> Param {
        self.as_ref().and_then(ToParam::to_param)
    }
}

// ==================== Dynamic ====================

impl ToParam for Value {
    fn to_param(&self) -> Param {
        match self {
            Value::Null => None,
            Value::BigInt(v) => v.to_param(),
            Value::Bool(v) => v.to_param(),
            Value::Double(v) => v.to_param(),
            Value::Int(v) => v.to_param(),
            Value::Float(v) => v.to_param(),
            Value::SmallInt(v) => v.to_param(),
            Value::Text(v) => v.to_param(),
        }
    }
}

/// Build a parameter list from native values.
///
/// ```ignore
/// let id: i64 = 42;
/// let name: Option<&str> = None;
/// pipeline.query("SELECT $1::int8, $2::text", params!(id, name), |rs| { /* ... */ });
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::types::Param>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::types::ToParam::to_param(&$value)),+]
    };
}
