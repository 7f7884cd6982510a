//! Mapping from engine column types to PostgreSQL wire types.
//!
//! The engine declares column types by name; clients speak OIDs. Integers
//! and floats travel as text (`DataTypeSize` 8, format 0), `blob` maps to
//! `bytea` and travels binary, everything else is text.

use crate::engine::{Column, Value};

/// The PostgreSQL type OIDs the gateway emits.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const TEXT: u32 = 25;
    pub const FLOAT8: u32 = 701;
    pub const DATE: u32 = 1082;
    pub const TIMESTAMPTZ: u32 = 1184;
}

/// One synthesised `RowDescription` entry. Never backed by a real table, so
/// the table fields are zero and the modifier is -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Map a declared engine type name (matched case-insensitively) to the OID
/// it is reported under.
pub fn type_oid_for(decl_type: &str) -> u32 {
    let lowered = decl_type.to_ascii_lowercase();
    match lowered.as_str() {
        "integer" | "int" | "tinyint" | "smallint" | "mediumint" | "bigint"
        | "unsigned big int" | "int2" | "int8" => oid::INT8,
        "float" | "real" | "double" | "double precision" => oid::FLOAT8,
        "blob" => oid::BYTEA,
        "datetime" => oid::TIMESTAMPTZ,
        "date" => oid::DATE,
        "boolean" => oid::BOOL,
        _ if lowered.starts_with("decimal") => oid::FLOAT8,
        _ => oid::TEXT,
    }
}

pub fn field_description(column: &Column) -> FieldDescription {
    let type_oid = type_oid_for(&column.decl_type);
    let (type_size, format) = match type_oid {
        oid::INT8 | oid::FLOAT8 => (8, 0),
        oid::BYTEA => (-1, 1),
        _ => (-1, 0),
    };
    FieldDescription {
        name: column.name.clone(),
        table_oid: 0,
        column_attr: 0,
        type_oid,
        type_size,
        type_modifier: -1,
        format,
    }
}

/// Encode one scanned value for a `DataRow` cell. `None` is sent as the
/// null length (-1), distinct from an empty value.
pub fn encode_value(type_oid: u32, value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Blob(bytes) => Some(bytes.clone()),
        Value::Integer(v) if type_oid == oid::BOOL => {
            Some(if *v != 0 { b"t".to_vec() } else { b"f".to_vec() })
        }
        Value::Integer(v) => Some(v.to_string().into_bytes()),
        Value::Real(v) => Some(format!("{v:.6}").into_bytes()),
        Value::Text(s) => Some(s.clone().into_bytes()),
    }
}
