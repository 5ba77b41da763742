//! Backend-neutral parameter and column values

use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A statement parameter or a column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Array(Vec<SqlValue>),
    Json(JsonValue),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        *self == SqlValue::Null
    }

    /// Short name of the variant, used in conversion errors
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int(_) => "int",
            SqlValue::Float(_) => "float",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
            SqlValue::Array(_) => "array",
            SqlValue::Json(_) => "json",
        }
    }

    /// SQLite has no boolean type; integers are accepted
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            SqlValue::Bool(b) => Some(b),
            SqlValue::Int(i) => Some(i != 0),
            _ => None,
        }
    }

    /// Floats are truncated
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            SqlValue::Int(i) => Some(i),
            SqlValue::Float(f) => Some(f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            SqlValue::Float(f) => Some(f),
            SqlValue::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let SqlValue::Text(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Blob(bytes) => Some(bytes.as_slice()),
            SqlValue::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Read a UUID stored as text or as 16 raw bytes. NULL yields `Ok(None)`.
    pub fn as_uuid(&self) -> DbResult<Option<Uuid>> {
        let parsed = match self {
            SqlValue::Null => return Ok(None),
            SqlValue::Blob(b) if b.len() == 16 => Uuid::from_slice(b),
            SqlValue::Blob(b) => Uuid::try_parse_ascii(b),
            SqlValue::Text(s) => Uuid::parse_str(s),
            SqlValue::Json(JsonValue::String(s)) => Uuid::parse_str(s),
            other => {
                return Err(DbError::TypeConversion(format!(
                    "cannot scan {} into UUID",
                    other.kind()
                )));
            }
        };
        parsed
            .map(Some)
            .map_err(|e| DbError::TypeConversion(e.to_string()))
    }

    /// Read a timestamp stored as RFC 3339 text, as `YYYY-MM-DD HH:MM:SS[.f]`
    /// (assumed UTC), or as unix seconds.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                }),
            SqlValue::Int(secs) => DateTime::from_timestamp(*secs, 0),
            _ => None,
        }
    }

    /// Blobs become arrays of byte values; non-finite floats become null
    pub fn into_json(self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(b) => b.into(),
            SqlValue::Int(i) => i.into(),
            SqlValue::Float(f) => f.into(),
            SqlValue::Text(s) => s.into(),
            SqlValue::Blob(bytes) => bytes.into(),
            SqlValue::Array(items) => items.into_iter().map(SqlValue::into_json).collect(),
            SqlValue::Json(v) => v,
        }
    }
}

/// JSON objects stay whole; scalars and arrays map onto the matching variant
impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(b) => SqlValue::Bool(b),
            JsonValue::Number(n) => n
                .as_i64()
                .map(SqlValue::Int)
                .or_else(|| n.as_f64().map(SqlValue::Float))
                .unwrap_or_else(|| SqlValue::Text(n.to_string())),
            JsonValue::String(s) => SqlValue::Text(s),
            JsonValue::Array(items) => SqlValue::Array(items.into_iter().map(Self::from).collect()),
            object => SqlValue::Json(object),
        }
    }
}

macro_rules! sql_value_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )*
    };
}

sql_value_from! {
    bool => |v| SqlValue::Bool(v),
    i32 => |v| SqlValue::Int(i64::from(v)),
    i64 => |v| SqlValue::Int(v),
    f64 => |v| SqlValue::Float(v),
    String => |v| SqlValue::Text(v),
    &str => |v| SqlValue::Text(v.to_owned()),
    Vec<u8> => |v| SqlValue::Blob(v),
    Uuid => |v| SqlValue::Text(v.hyphenated().to_string()),
    DateTime<Utc> => |v| SqlValue::Text(v.to_rfc3339()),
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}
