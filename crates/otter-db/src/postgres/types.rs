//! Mapping between [`SqlValue`] and PostgreSQL wire types

use crate::value::SqlValue;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::Row;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use uuid::Uuid;

type Encoded = Result<IsNull, Box<dyn std::error::Error + Sync + Send>>;

/// Binds a [`SqlValue`] against whatever column type the server reports.
///
/// Integers narrow with a range check, text is parsed when the column is a
/// uuid, timestamp, date or json, and arrays travel as JSON.
#[derive(Debug)]
pub struct Param<'a>(pub &'a SqlValue);

impl ToSql for Param<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Encoded {
        match self.0 {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(flag) => flag.to_sql(ty, out),
            SqlValue::Int(n) => encode_int(*n, ty, out),
            SqlValue::Float(x) => encode_float(*x, ty, out),
            SqlValue::Text(text) => encode_text(text, ty, out),
            SqlValue::Blob(bytes) if *ty == Type::UUID => Uuid::from_slice(bytes)?.to_sql(ty, out),
            SqlValue::Blob(bytes) => bytes.as_slice().to_sql(ty, out),
            SqlValue::Json(json) => encode_json(json, ty, out),
            array @ SqlValue::Array(_) => encode_json(&array.clone().into_json(), ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn encode_int(n: i64, ty: &Type, out: &mut BytesMut) -> Encoded {
    match *ty {
        Type::INT2 => i16::try_from(n)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(n)?.to_sql(ty, out),
        Type::FLOAT4 => (n as f32).to_sql(ty, out),
        Type::FLOAT8 => (n as f64).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR => n.to_string().to_sql(ty, out),
        Type::TIMESTAMPTZ => DateTime::<Utc>::from_timestamp(n, 0)
            .ok_or("timestamp out of range")?
            .to_sql(ty, out),
        _ => n.to_sql(ty, out),
    }
}

fn encode_float(x: f64, ty: &Type, out: &mut BytesMut) -> Encoded {
    match *ty {
        Type::FLOAT4 => (x as f32).to_sql(ty, out),
        Type::INT2 => i16::try_from(whole(x)?)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(whole(x)?)?.to_sql(ty, out),
        Type::INT8 => whole(x)?.to_sql(ty, out),
        Type::TEXT | Type::VARCHAR => x.to_string().to_sql(ty, out),
        _ => x.to_sql(ty, out),
    }
}

/// A float bound to an integer column must hold an exact integer in range
fn whole(x: f64) -> Result<i64, Box<dyn std::error::Error + Sync + Send>> {
    // i64::MAX rounds up to 2^63 as f64, which is itself out of range
    let in_range = x >= i64::MIN as f64 && x < i64::MAX as f64;
    if x.fract() != 0.0 || !in_range {
        return Err(format!("{} does not fit an integer column", x).into());
    }
    Ok(x as i64)
}

fn encode_text(text: &str, ty: &Type, out: &mut BytesMut) -> Encoded {
    match *ty {
        Type::UUID => Uuid::parse_str(text)?.to_sql(ty, out),
        Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(text)?
            .with_timezone(&Utc)
            .to_sql(ty, out),
        Type::TIMESTAMP => NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))?
            .to_sql(ty, out),
        Type::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")?.to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::from_str::<JsonValue>(text)?.to_sql(ty, out),
        _ => text.to_sql(ty, out),
    }
}

fn encode_json(json: &JsonValue, ty: &Type, out: &mut BytesMut) -> Encoded {
    match *ty {
        Type::TEXT | Type::VARCHAR => json.to_string().to_sql(ty, out),
        _ => json.to_sql(ty, out),
    }
}

pub fn params(values: &[SqlValue]) -> Vec<Param<'_>> {
    values.iter().map(Param).collect()
}

pub fn as_refs<'a>(params: &'a [Param<'_>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Read column `index` as `T`; NULL and undecodable values become `SqlValue::Null`
fn read<'a, T, F>(row: &'a Row, index: usize, wrap: F) -> SqlValue
where
    T: FromSql<'a>,
    F: FnOnce(T) -> SqlValue,
{
    match row.try_get::<_, Option<T>>(index) {
        Ok(Some(value)) => wrap(value),
        Ok(None) => SqlValue::Null,
        Err(err) => {
            tracing::debug!(column = index, error = %err, "undecodable postgres value");
            SqlValue::Null
        }
    }
}

/// Column `index` of `row` as a [`SqlValue`]
pub fn from_pg_value(row: &Row, index: usize) -> SqlValue {
    let ty = row.columns()[index].type_();

    match ty.name() {
        "bool" => read(row, index, SqlValue::Bool),
        "int2" => read(row, index, |v: i16| SqlValue::Int(i64::from(v))),
        "int4" => read(row, index, |v: i32| SqlValue::Int(i64::from(v))),
        "int8" => read(row, index, SqlValue::Int),
        "float4" => read(row, index, |v: f32| SqlValue::Float(f64::from(v))),
        "float8" => read(row, index, SqlValue::Float),
        "text" | "varchar" | "char" | "bpchar" | "name" => read(row, index, SqlValue::Text),
        "bytea" => read(row, index, SqlValue::Blob),
        "json" | "jsonb" => read(row, index, SqlValue::Json),
        "uuid" => read(row, index, |v: Uuid| SqlValue::from(v)),
        "timestamptz" => read(row, index, |v: DateTime<Utc>| SqlValue::from(v)),
        "timestamp" => read(row, index, |v: NaiveDateTime| SqlValue::from(v.and_utc())),
        "date" => read(row, index, |v: NaiveDate| {
            SqlValue::Text(v.format("%Y-%m-%d").to_string())
        }),
        name if name.starts_with('_') => read_array(row, index),
        // Anything text-like (enums, citext, ...) decodes as a string
        _ => read(row, index, SqlValue::Text),
    }
}

/// Arrays of the common element types; anything else reads as NULL
fn read_array(row: &Row, index: usize) -> SqlValue {
    fn elements<'a, T: FromSql<'a>>(row: &'a Row, index: usize) -> Option<Vec<T>> {
        row.try_get::<_, Option<Vec<T>>>(index).ok().flatten()
    }
    fn wrap<T>(items: Vec<T>, f: impl FnMut(T) -> SqlValue) -> SqlValue {
        SqlValue::Array(items.into_iter().map(f).collect())
    }

    if let Some(items) = elements::<String>(row, index) {
        wrap(items, SqlValue::Text)
    } else if let Some(items) = elements::<i64>(row, index) {
        wrap(items, SqlValue::Int)
    } else if let Some(items) = elements::<i32>(row, index) {
        wrap(items, |n| SqlValue::Int(n.into()))
    } else if let Some(items) = elements::<f64>(row, index) {
        wrap(items, SqlValue::Float)
    } else if let Some(items) = elements::<bool>(row, index) {
        wrap(items, SqlValue::Bool)
    } else if let Some(items) = elements::<Uuid>(row, index) {
        wrap(items, SqlValue::from)
    } else {
        SqlValue::Null
    }
}
