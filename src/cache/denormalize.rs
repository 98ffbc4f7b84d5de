//! Rebuilding response-shaped values from normalized records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::field_key::field_key;
use super::record::{FieldRef, FieldValue, Link, RecordKey};
use super::store::RecordStore;
use crate::artifact::{FieldSelection, Selection};
use crate::value::ResponseValue;

/// Result of walking a selection through the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Denormalized {
  pub data: ResponseValue,
  /// Some selected field has no value in the cache
  pub partial: bool,
  /// Some field read is marked stale or older than the configured age
  pub stale: bool,
  /// Every field consulted, for subscription bookkeeping
  pub fields: BTreeSet<FieldRef>,
}

pub struct Denormalizer<'a> {
  store: &'a RecordStore,
  variables: &'a Map<String, Value>,
  now: DateTime<Utc>,
  partial: bool,
  stale: bool,
  fields: BTreeSet<FieldRef>,
}

impl<'a> Denormalizer<'a> {
  pub fn new(store: &'a RecordStore, variables: &'a Map<String, Value>) -> Self {
    Self {
      store,
      variables,
      now: Utc::now(),
      partial: false,
      stale: false,
      fields: BTreeSet::new(),
    }
  }

  /// Read `selection` starting at `parent`.
  pub fn run(mut self, selection: &Selection, parent: &RecordKey) -> Denormalized {
    let data = self.object(selection, parent);
    Denormalized {
      data,
      partial: self.partial,
      stale: self.stale,
      fields: self.fields,
    }
  }

  /// An object whose non-nullable field resolved to null is itself null.
  fn object(&mut self, selection: &Selection, key: &RecordKey) -> ResponseValue {
    let type_name = self.store.record_type(key).map(str::to_string);
    let mut out = BTreeMap::new();
    let mut null_cascade = false;
    for field in selection.fields_for(type_name.as_deref()) {
      if !field.is_selected(self.variables) {
        continue;
      }
      let value = self.field(field, key);
      if value.is_null() && !field.nullable {
        null_cascade = true;
      }
      out.insert(field.response_key().to_string(), value);
    }
    if null_cascade {
      ResponseValue::Null
    } else {
      ResponseValue::Object(out)
    }
  }

  fn field(&mut self, field: &FieldSelection, key: &RecordKey) -> ResponseValue {
    let storage_key = field_key(field, self.variables);
    let store = self.store;
    let value = store.read(key, &storage_key);
    if value.is_some() && store.is_stale(key, &storage_key, self.now) {
      self.stale = true;
    }
    self.fields.insert(FieldRef::new(key.clone(), storage_key));

    match (value, &field.selection) {
      (None, _) => {
        self.partial = true;
        ResponseValue::Unknown
      }
      (Some(FieldValue::Scalar(Value::Null)), _) => ResponseValue::Null,
      (Some(FieldValue::Scalar(v)), _) => ResponseValue::Scalar(v.clone()),
      (Some(FieldValue::Link(link)), Some(selection)) => self.link(link, selection),
      // link stored for a field selected as a scalar: nothing sensible to show
      (Some(FieldValue::Link(_)), None) => {
        self.partial = true;
        ResponseValue::Unknown
      }
    }
  }

  fn link(&mut self, link: &Link, selection: &Selection) -> ResponseValue {
    match link {
      Link::Null => ResponseValue::Null,
      Link::Record(key) if !self.store.exists(key) => ResponseValue::Null,
      Link::Record(key) => self.object(selection, key),
      // records hidden by a layer drop out of lists instead of reading null
      Link::List(items) => {
        let store = self.store;
        ResponseValue::List(
          items
            .iter()
            .filter(|item| !matches!(item, Link::Record(key) if !store.exists(key)))
            .map(|item| self.link(item, selection))
            .collect(),
        )
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::Artifact;
  use crate::cache::record::FieldWrite;
  use crate::cache::store::WriteTarget;
  use serde_json::json;

  fn viewer_artifact() -> Artifact {
    serde_json::from_value(json!({
      "name": "Viewer",
      "kind": "query",
      "selection": { "fields": [{
        "field": "viewer",
        "type": "User",
        "selection": { "fields": [
          { "field": "id", "type": "ID", "nullable": false },
          { "field": "name", "type": "String" },
          { "field": "email", "type": "String", "include": "withEmail" }
        ] }
      }] }
    }))
    .unwrap()
  }

  fn write(store: &mut RecordStore, key: &str, field: &str, value: FieldValue) {
    store
      .write(
        vec![FieldWrite {
          key: RecordKey::new(key),
          type_name: None,
          field: field.to_string(),
          value,
        }],
        WriteTarget::Base,
      )
      .unwrap();
  }

  fn read(store: &RecordStore, artifact: &Artifact, vars: &Map<String, Value>) -> Denormalized {
    Denormalizer::new(store, vars).run(&artifact.selection, &RecordKey::root())
  }

  #[test]
  fn test_empty_cache_reads_unknown() {
    let store = RecordStore::new(None);
    let out = read(&store, &viewer_artifact(), &Map::new());

    assert!(out.partial);
    assert!(out.data.get("viewer").unwrap().is_unknown());
    assert!(out
      .fields
      .contains(&FieldRef::new(RecordKey::root(), "viewer")));
  }

  #[test]
  fn test_complete_read_and_conditional_field() {
    let mut store = RecordStore::new(None);
    write(&mut store, "User:1", "id", FieldValue::Scalar(json!("1")));
    write(&mut store, "User:1", "name", FieldValue::Scalar(Value::Null));
    write(
      &mut store,
      "_ROOT_",
      "viewer",
      FieldValue::Link(Link::Record(RecordKey::new("User:1"))),
    );

    let out = read(&store, &viewer_artifact(), &Map::new());
    assert!(!out.partial);
    assert_eq!(out.data.to_json(), json!({ "viewer": { "id": "1", "name": null } }));

    // the included field is not loaded yet
    let vars = json!({ "withEmail": true }).as_object().cloned().unwrap();
    let out = read(&store, &viewer_artifact(), &vars);
    assert!(out.partial);
    assert!(out
      .data
      .at_path(&["viewer", "email"])
      .unwrap()
      .is_unknown());
  }

  #[test]
  fn test_non_nullable_null_cascades_to_parent() {
    let mut store = RecordStore::new(None);
    write(&mut store, "User:1", "id", FieldValue::Scalar(Value::Null));
    write(&mut store, "User:1", "name", FieldValue::Scalar(json!("a")));
    write(
      &mut store,
      "_ROOT_",
      "viewer",
      FieldValue::Link(Link::Record(RecordKey::new("User:1"))),
    );

    let out = read(&store, &viewer_artifact(), &Map::new());
    assert!(out.data.get("viewer").unwrap().is_null());
  }

  #[test]
  fn test_link_to_missing_record_reads_null() {
    let mut store = RecordStore::new(None);
    write(
      &mut store,
      "_ROOT_",
      "viewer",
      FieldValue::Link(Link::Record(RecordKey::new("User:404"))),
    );

    let out = read(&store, &viewer_artifact(), &Map::new());
    assert!(out.data.get("viewer").unwrap().is_null());
    assert!(!out.partial);
  }
}
