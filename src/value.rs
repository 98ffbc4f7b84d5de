//! Response-shaped values produced by reading the cache.
//!
//! Unlike `serde_json::Value`, a [`ResponseValue`] can say a field is
//! [`ResponseValue::Unknown`]: not loaded yet, as opposed to loaded and null.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseValue {
  /// The cache has no value for this field
  Unknown,
  Null,
  Scalar(Value),
  List(Vec<ResponseValue>),
  Object(BTreeMap<String, ResponseValue>),
}

impl ResponseValue {
  /// Convert a raw response payload. JSON objects become `Object`s.
  pub fn from_json(value: &Value) -> Self {
    match value {
      Value::Null => ResponseValue::Null,
      Value::Array(items) => ResponseValue::List(items.iter().map(Self::from_json).collect()),
      Value::Object(map) => ResponseValue::Object(
        map
          .iter()
          .map(|(k, v)| (k.clone(), Self::from_json(v)))
          .collect(),
      ),
      scalar => ResponseValue::Scalar(scalar.clone()),
    }
  }

  /// Plain JSON view; unknown fields are rendered as null.
  pub fn to_json(&self) -> Value {
    match self {
      ResponseValue::Unknown | ResponseValue::Null => Value::Null,
      ResponseValue::Scalar(v) => v.clone(),
      ResponseValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
      ResponseValue::Object(map) => Value::Object(
        map
          .iter()
          .map(|(k, v)| (k.clone(), v.to_json()))
          .collect(),
      ),
    }
  }

  pub fn is_unknown(&self) -> bool {
    matches!(self, ResponseValue::Unknown)
  }

  pub fn is_null(&self) -> bool {
    matches!(self, ResponseValue::Null)
  }

  pub fn get(&self, key: &str) -> Option<&ResponseValue> {
    match self {
      ResponseValue::Object(map) => map.get(key),
      _ => None,
    }
  }

  /// Follow a path of object keys.
  pub fn at_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&ResponseValue> {
    path
      .iter()
      .try_fold(self, |value, key| value.get(key.as_ref()))
  }

  pub fn as_list(&self) -> Option<&[ResponseValue]> {
    match self {
      ResponseValue::List(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      ResponseValue::Scalar(v) => v.as_str(),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      ResponseValue::Scalar(v) => v.as_bool(),
      _ => None,
    }
  }

  pub fn as_u64(&self) -> Option<u64> {
    match self {
      ResponseValue::Scalar(v) => v.as_u64(),
      _ => None,
    }
  }

  /// Whether any field anywhere below is unknown.
  pub fn has_unknown(&self) -> bool {
    match self {
      ResponseValue::Unknown => true,
      ResponseValue::List(items) => items.iter().any(Self::has_unknown),
      ResponseValue::Object(map) => map.values().any(Self::has_unknown),
      ResponseValue::Null | ResponseValue::Scalar(_) => false,
    }
  }
}

impl Serialize for ResponseValue {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.to_json().serialize(serializer)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_path_lookup() {
    let value = ResponseValue::from_json(&json!({
      "user": { "friends": { "pageInfo": { "hasNextPage": true } } }
    }));
    assert_eq!(
      value
        .at_path(&["user", "friends", "pageInfo", "hasNextPage"])
        .and_then(ResponseValue::as_bool),
      Some(true)
    );
    assert!(value.at_path(&["user", "missing"]).is_none());
  }

  #[test]
  fn test_unknown_is_distinct_from_null() {
    let mut map = BTreeMap::new();
    map.insert("name".to_string(), ResponseValue::Unknown);
    map.insert("email".to_string(), ResponseValue::Null);
    let value = ResponseValue::Object(map);

    assert!(value.get("name").unwrap().is_unknown());
    assert!(value.get("email").unwrap().is_null());
    assert!(value.has_unknown());
    assert_eq!(value.to_json(), json!({ "name": null, "email": null }));
  }
}
