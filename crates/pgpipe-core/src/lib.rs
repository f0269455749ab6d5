//! Core types for pgpipe.
//!
//! This crate holds the pieces that do not touch the wire:
//!
//! - `Value` for a single decoded column value, with strict typed access
//!   through `FromValue`
//! - `Error` and its per-category detail structs
//! - `Registry` for wiring named services without type-hash tricks

pub mod error;
pub mod registry;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DecodeError, DecodeErrorKind, DesyncError,
    Error, QueryError, QueryErrorKind, Result,
};
pub use registry::Registry;
pub use value::{FromValue, Value};
