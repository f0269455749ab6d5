//! PostgreSQL type conversion.
//!
//! This module provides:
//! - OID constants for the built-in types a result column may carry
//! - Text encoding of query parameters (`ToParam`, `params!`)
//! - OID-driven decoding of result columns into `Value`
//!
//! # Example
//!
//! ```rust,ignore
//! use pgpipe::types::{oid, decode_value};
//!
//! let value = decode_value(oid::INT8, Some("565197576026980365"))?;
//! assert_eq!(value, Value::BigInt(565_197_576_026_980_365));
//! ```

pub mod decode;
pub mod encode;
pub mod oid;

pub use decode::{TextDecode, decode_value};
pub use encode::{Param, ToParam};
