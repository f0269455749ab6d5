//! PostgreSQL type Object IDs (OIDs).
//!
//! Result columns carry the OID of their type. The decoder understands the
//! scalar types listed first; the rest are named only so that an
//! `UnsupportedType` error can say what the server actually sent.

/// Boolean type
pub const BOOL: u32 = 16;

/// Single character (char)
pub const CHAR: u32 = 18;

/// 8-byte signed integer (int8/bigint)
pub const INT8: u32 = 20;

/// 2-byte signed integer (int2/smallint)
pub const INT2: u32 = 21;

/// 4-byte signed integer (int4/integer)
pub const INT4: u32 = 23;

/// Variable-length text (text)
pub const TEXT: u32 = 25;

/// Single-precision floating point (float4/real)
pub const FLOAT4: u32 = 700;

/// Double-precision floating point (float8/double precision)
pub const FLOAT8: u32 = 701;

/// Fixed-length character (bpchar)
pub const BPCHAR: u32 = 1042;

/// Variable-length character with limit (varchar)
pub const VARCHAR: u32 = 1043;

// ==================== Not decoded ====================

/// Byte array (bytea)
pub const BYTEA: u32 = 17;

/// Name type (internal, 63-byte identifier)
pub const NAME: u32 = 19;

/// Object identifier (oid)
pub const OID: u32 = 26;

/// JSON (text-based)
pub const JSON: u32 = 114;

/// Date (no time)
pub const DATE: u32 = 1082;

/// Timestamp without time zone
pub const TIMESTAMP: u32 = 1114;

/// Timestamp with time zone
pub const TIMESTAMPTZ: u32 = 1184;

/// Arbitrary precision numeric
pub const NUMERIC: u32 = 1700;

/// UUID (16-byte identifier)
pub const UUID: u32 = 2950;

/// JSONB (binary JSON)
pub const JSONB: u32 = 3802;

/// Unknown type
pub const UNKNOWN: u32 = 705;

/// Whether columns of this type can be decoded into a `Value`.
#[must_use]
pub const fn is_decodable(type_oid: u32) -> bool {
    matches!(
        type_oid,
        BOOL | CHAR | INT8 | INT2 | INT4 | TEXT | FLOAT4 | FLOAT8 | BPCHAR | VARCHAR
    )
}

/// Get a human-readable name for a type OID.
#[must_use]
pub const fn type_name(type_oid: u32) -> &'static str {
    match type_oid {
        BOOL => "bool",
        BYTEA => "bytea",
        CHAR => "char",
        NAME => "name",
        INT8 => "int8",
        INT2 => "int2",
        INT4 => "int4",
        TEXT => "text",
        OID => "oid",
        JSON => "json",
        FLOAT4 => "float4",
        FLOAT8 => "float8",
        VARCHAR => "varchar",
        BPCHAR => "bpchar",
        DATE => "date",
        TIMESTAMP => "timestamp",
        TIMESTAMPTZ => "timestamptz",
        NUMERIC => "numeric",
        UUID => "uuid",
        JSONB => "jsonb",
        _ => "unknown",
    }
}
