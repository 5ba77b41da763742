//! Mapping between [`SqlValue`] and SQLite storage classes

use crate::value::SqlValue;
use rusqlite::Row;
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};

/// Binds a [`SqlValue`] without copying text or blobs. Arrays and JSON
/// documents are bound as JSON text.
pub struct Param<'a>(pub &'a SqlValue);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let output = match self.0 {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(flag) => ToSqlOutput::Owned(Value::Integer((*flag).into())),
            SqlValue::Int(n) => ToSqlOutput::Owned(Value::Integer(*n)),
            SqlValue::Float(x) => ToSqlOutput::Owned(Value::Real(*x)),
            SqlValue::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            SqlValue::Blob(bytes) => ToSqlOutput::Borrowed(ValueRef::Blob(bytes)),
            SqlValue::Json(json) => ToSqlOutput::Owned(Value::Text(json.to_string())),
            array @ SqlValue::Array(_) => {
                ToSqlOutput::Owned(Value::Text(array.clone().into_json().to_string()))
            }
        };
        Ok(output)
    }
}

/// Whether a declared column type marks the column as holding JSON
pub fn is_json_decl(decl: &str) -> bool {
    decl.eq_ignore_ascii_case("json") || decl.eq_ignore_ascii_case("jsonb")
}

/// Column `index` of `row`; unreadable columns come back as NULL. Text in
/// a `json` column is parsed, falling back to plain text when it isn't
/// valid JSON.
pub fn column_value(row: &Row<'_>, index: usize, json: bool) -> SqlValue {
    let Ok(raw) = row.get_ref(index) else {
        return SqlValue::Null;
    };
    match raw {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Int(n),
        ValueRef::Real(x) => SqlValue::Float(x),
        ValueRef::Text(bytes) if json => match serde_json::from_slice(bytes) {
            Ok(document) => SqlValue::Json(document),
            Err(_) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        },
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_declarations() {
        assert!(is_json_decl("JSON"));
        assert!(is_json_decl("jsonb"));
        assert!(!is_json_decl("TEXT"));
        assert!(!is_json_decl("json_text"));
    }
}
