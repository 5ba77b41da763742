//! JSON document columns
//!
//! [`Jsonb`] holds a JSON object and [`JsonbArray`] a JSON array. Both map
//! to [`SqlValue::Json`] when bound as parameters and accept JSON, text or
//! bytes when read back.

use crate::error::{DbError, DbResult};
use crate::value::SqlValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::ops::{Deref, DerefMut};

/// JSON object column. Paths are dotted keys, e.g. `"address.city"`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jsonb(pub Map<String, JsonValue>);

impl Jsonb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        segments.try_fold(self.0.get(first)?, |value, key| value.as_object()?.get(key))
    }

    /// Set the value at `path`, creating intermediate objects. Intermediate
    /// values that are not objects are replaced.
    pub fn set(&mut self, path: &str, value: impl Into<JsonValue>) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().unwrap_or(path);

        let mut current = &mut self.0;
        for key in segments {
            let entry = current
                .entry(key.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if !entry.is_object() {
                *entry = JsonValue::Object(Map::new());
            }
            let JsonValue::Object(map) = entry else {
                return;
            };
            current = map;
        }
        current.insert(last.to_string(), value.into());
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Remove and return the value at `path`
    pub fn remove(&mut self, path: &str) -> Option<JsonValue> {
        match path.rsplit_once('.') {
            None => self.0.remove(path),
            Some((parent, key)) => {
                let mut current = &mut self.0;
                for segment in parent.split('.') {
                    current = current.get_mut(segment)?.as_object_mut()?;
                }
                current.remove(key)
            }
        }
    }

    /// Top-level keys
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str()
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path)?.as_i64()
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path)?.as_f64()
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path)?.as_bool()
    }

    /// Deserialize the value at `path`. `Ok(None)` when the path is absent.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> DbResult<Option<T>> {
        self.get(path)
            .map(|value| T::deserialize(value))
            .transpose()
            .map_err(|e| DbError::TypeConversion(format!("{}: {}", path, e)))
    }

    pub fn to_sql_value(&self) -> SqlValue {
        SqlValue::Json(JsonValue::Object(self.0.clone()))
    }

    /// Read a column value. SQL NULL yields `None`; empty text yields an
    /// empty document.
    pub fn from_sql_value(value: &SqlValue) -> DbResult<Option<Self>> {
        match scan(value, "JSONB")? {
            None => Ok(None),
            Some(None) => Ok(Some(Self::new())),
            Some(Some(JsonValue::Object(map))) => Ok(Some(Self(map))),
            Some(Some(other)) => Err(DbError::TypeConversion(format!(
                "cannot scan {} into JSONB",
                json_kind(&other)
            ))),
        }
    }
}

impl Deref for Jsonb {
    type Target = Map<String, JsonValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Jsonb {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, JsonValue>> for Jsonb {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

impl From<Jsonb> for SqlValue {
    fn from(doc: Jsonb) -> Self {
        SqlValue::Json(JsonValue::Object(doc.0))
    }
}

/// JSON array column
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonbArray(pub Vec<JsonValue>);

impl JsonbArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_sql_value(&self) -> SqlValue {
        SqlValue::Json(JsonValue::Array(self.0.clone()))
    }

    pub fn from_sql_value(value: &SqlValue) -> DbResult<Option<Self>> {
        match scan(value, "JSONB array")? {
            None => Ok(None),
            Some(None) => Ok(Some(Self::new())),
            Some(Some(JsonValue::Array(items))) => Ok(Some(Self(items))),
            Some(Some(other)) => Err(DbError::TypeConversion(format!(
                "cannot scan {} into JSONB array",
                json_kind(&other)
            ))),
        }
    }
}

impl Deref for JsonbArray {
    type Target = Vec<JsonValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for JsonbArray {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<JsonbArray> for SqlValue {
    fn from(items: JsonbArray) -> Self {
        SqlValue::Json(JsonValue::Array(items.0))
    }
}

/// `None` for NULL, `Some(None)` for empty input, otherwise the parsed value
fn scan(value: &SqlValue, target: &str) -> DbResult<Option<Option<JsonValue>>> {
    let bytes: &[u8] = match value {
        SqlValue::Null => return Ok(None),
        SqlValue::Json(json) => return Ok(Some(Some(json.clone()))),
        SqlValue::Text(s) => s.as_bytes(),
        SqlValue::Blob(b) => b,
        other => {
            return Err(DbError::TypeConversion(format!(
                "cannot scan {} into {}",
                other.kind(),
                target
            )));
        }
    };

    if bytes.is_empty() {
        return Ok(Some(None));
    }
    serde_json::from_slice(bytes)
        .map(|json| Some(Some(json)))
        .map_err(|e| DbError::TypeConversion(format!("failed to unmarshal {}: {}", target, e)))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Jsonb {
        match value {
            JsonValue::Object(map) => Jsonb(map),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_dotted_paths() {
        let mut d = doc(json!({"name": "Ada", "address": {"city": "London"}}));
        assert_eq!(d.get_str("address.city"), Some("London"));
        assert!(d.has("name"));
        assert!(!d.has("address.zip"));
        assert!(!d.has("name.first"));

        d.set("address.zip", "N1");
        d.set("meta.tags.primary", true);
        assert_eq!(d.get_str("address.zip"), Some("N1"));
        assert_eq!(d.get_bool("meta.tags.primary"), Some(true));

        // Non-object intermediates are replaced
        d.set("name.first", "Ada");
        assert_eq!(d.get_str("name.first"), Some("Ada"));

        assert_eq!(d.remove("address.city"), Some(json!("London")));
        assert!(!d.has("address.city"));
        assert_eq!(d.remove("missing.path"), None);

        let mut keys = d.keys();
        keys.sort();
        assert_eq!(keys, vec!["address", "meta", "name"]);
    }

    #[test]
    fn test_typed_getters() {
        let d = doc(json!({"n": 3, "f": 1.5, "tags": ["a", "b"]}));
        assert_eq!(d.get_i64("n"), Some(3));
        assert_eq!(d.get_f64("f"), Some(1.5));
        assert_eq!(d.get_i64("f"), None);
        assert_eq!(
            d.get_as::<Vec<String>>("tags").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(d.get_as::<u32>("missing").unwrap(), None);
        assert!(d.get_as::<u32>("tags").is_err());
    }

    #[test]
    fn test_scan_inputs() {
        assert_eq!(Jsonb::from_sql_value(&SqlValue::Null).unwrap(), None);
        assert_eq!(
            Jsonb::from_sql_value(&SqlValue::Text(String::new())).unwrap(),
            Some(Jsonb::new())
        );
        assert_eq!(
            Jsonb::from_sql_value(&SqlValue::Blob(br#"{"a":1}"#.to_vec()))
                .unwrap()
                .and_then(|d| d.get_i64("a")),
            Some(1)
        );
        assert_eq!(
            Jsonb::from_sql_value(&SqlValue::Json(json!({"a": 1}))).unwrap(),
            Some(doc(json!({"a": 1})))
        );

        let err = Jsonb::from_sql_value(&SqlValue::Int(1)).unwrap_err();
        assert!(matches!(err, DbError::TypeConversion(_)));
        assert!(err.to_string().contains("cannot scan"));
        assert!(Jsonb::from_sql_value(&SqlValue::Json(json!([1]))).is_err());
        assert!(Jsonb::from_sql_value(&SqlValue::Text("{broken".into())).is_err());
    }

    #[test]
    fn test_array_scan_and_marshal() {
        let items = JsonbArray::from_sql_value(&SqlValue::Text("[1,2]".into()))
            .unwrap()
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.to_sql_value(), SqlValue::Json(json!([1, 2])));

        assert_eq!(
            JsonbArray::from_sql_value(&SqlValue::Blob(Vec::new())).unwrap(),
            Some(JsonbArray::new())
        );
        assert!(JsonbArray::from_sql_value(&SqlValue::Json(json!({}))).is_err());
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let db = crate::Db::sqlite(":memory:").unwrap();
        db.execute("CREATE TABLE docs (body TEXT)", &[]).await.unwrap();

        let mut body = Jsonb::new();
        body.set("resource.type", "Patient");
        db.execute("INSERT INTO docs (body) VALUES (?)", &[body.to_sql_value()])
            .await
            .unwrap();

        let result = db.query("SELECT body FROM docs", &[]).await.unwrap();
        let value = result.first().unwrap().get("body").unwrap();
        let back = Jsonb::from_sql_value(value).unwrap().unwrap();
        assert_eq!(back.get_str("resource.type"), Some("Patient"));
    }
}
