//! Flattening of response data into record field writes.
//!
//! Normalization is pure: it reads the current store only to merge paged
//! lists and produces a [`Normalized`] batch. Nothing is written until the
//! whole payload has been walked, so a payload that fails to normalize
//! leaves the cache untouched.

use serde_json::{Map, Value};

use super::field_key::{field_key, full_field_key, resolved_arguments};
use super::lists::ListInstance;
use super::record::{FieldValue, FieldWrite, Link, RecordKey};
use super::store::{merge_links, RecordStore};
use crate::artifact::{
  FieldSelection, ListAction, ListPosition, ListWhen, Selection, UpdateMode,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// A list operation found in a mutation payload, applied after the batch's
/// record writes.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingListOp {
  pub action: ListAction,
  pub list: Option<String>,
  pub member: RecordKey,
  pub member_type: Option<String>,
  pub position: ListPosition,
  /// Parent record key or id the target list must live under
  pub parent: Option<String>,
  pub when: Option<ListWhen>,
}

/// Everything one payload writes.
#[derive(Debug, Default)]
pub struct Normalized {
  pub writes: Vec<FieldWrite>,
  pub lists: Vec<ListInstance>,
  pub operations: Vec<PendingListOp>,
}

pub struct Normalizer<'a> {
  store: &'a RecordStore,
  variables: &'a Map<String, Value>,
  apply_updates: &'a [UpdateMode],
  config: &'a CacheConfig,
  out: Normalized,
}

impl<'a> Normalizer<'a> {
  pub fn new(
    store: &'a RecordStore,
    variables: &'a Map<String, Value>,
    apply_updates: &'a [UpdateMode],
    config: &'a CacheConfig,
  ) -> Self {
    Self {
      store,
      variables,
      apply_updates,
      config,
      out: Normalized::default(),
    }
  }

  /// Normalize `data` against `selection`, writing top-level fields onto
  /// `parent`.
  pub fn run(
    mut self,
    selection: &Selection,
    parent: &RecordKey,
    parent_type: Option<&str>,
    data: &Value,
  ) -> Result<Normalized> {
    let object = data.as_object().ok_or_else(|| CacheError::InvalidData {
      path: String::new(),
      message: "expected an object at the root of the payload".to_string(),
    })?;
    let type_name = object
      .get("__typename")
      .and_then(Value::as_str)
      .or(parent_type);
    self.object_fields(selection, parent, type_name, object, "")?;
    Ok(self.out)
  }

  fn object_fields(
    &mut self,
    selection: &Selection,
    key: &RecordKey,
    type_name: Option<&str>,
    object: &Map<String, Value>,
    path: &str,
  ) -> Result<()> {
    for field in selection.fields_for(type_name) {
      if !field.is_selected(self.variables) {
        continue;
      }
      let Some(value) = object.get(field.response_key()) else {
        continue;
      };
      if !self.should_write(field) {
        continue;
      }
      let field_path = join_path(path, field.response_key());
      self.field(field, key, type_name, value, &field_path)?;
    }
    Ok(())
  }

  /// With update modes in play, fields marked for other modes keep their
  /// current value.
  fn should_write(&self, field: &FieldSelection) -> bool {
    self.apply_updates.is_empty()
      || field.updates.is_empty()
      || field.updates.iter().any(|m| self.apply_updates.contains(m))
  }

  fn merge_mode(&self, field: &FieldSelection) -> Option<UpdateMode> {
    self
      .apply_updates
      .iter()
      .copied()
      .find(|mode| field.updates.contains(mode))
  }

  fn field(
    &mut self,
    field: &FieldSelection,
    parent: &RecordKey,
    parent_type: Option<&str>,
    value: &Value,
    path: &str,
  ) -> Result<()> {
    let storage_key = field_key(field, self.variables);
    let written = match &field.selection {
      None => FieldValue::Scalar(value.clone()),
      Some(selection) => {
        let link = self.link(field, selection, parent, &storage_key, value, path, None)?;
        let link = match self.merge_mode(field) {
          Some(mode) => merge_links(self.store.read(parent, &storage_key), link, mode),
          None => link,
        };
        self.register_list(field, parent, &storage_key, &link);
        FieldValue::Link(link)
      }
    };

    if !field.operations.is_empty() {
      self.queue_operations(field, &written, value, path)?;
    }

    self.out.writes.push(FieldWrite {
      key: parent.clone(),
      type_name: parent_type.map(str::to_string),
      field: storage_key,
      value: written,
    });
    Ok(())
  }

  /// Normalize an object-typed value (object, null, or nested list of them).
  #[allow(clippy::too_many_arguments)]
  fn link(
    &mut self,
    field: &FieldSelection,
    selection: &Selection,
    parent: &RecordKey,
    storage_key: &str,
    value: &Value,
    path: &str,
    index: Option<&str>,
  ) -> Result<Link> {
    match value {
      Value::Null => Ok(Link::Null),
      Value::Array(items) => {
        let mut links = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
          let item_path = format!("{}[{}]", path, i);
          let item_index = match index {
            Some(outer) => format!("{}][{}", outer, i),
            None => i.to_string(),
          };
          links.push(self.link(
            field,
            selection,
            parent,
            storage_key,
            item,
            &item_path,
            Some(&item_index),
          )?);
        }
        Ok(Link::List(links))
      }
      Value::Object(object) => {
        let type_name = object
          .get("__typename")
          .and_then(Value::as_str)
          .unwrap_or(&field.type_name);
        let key = match index {
          _ if !field.embedded => self.record_key(type_name, object, path)?,
          None => RecordKey::embedded(parent, storage_key),
          Some(index) => self.item_key(field, selection, parent, storage_key, object, index, path)?,
        };
        self.object_fields(selection, &key, Some(type_name), object, path)?;
        Ok(Link::Record(key))
      }
      other => Err(CacheError::InvalidData {
        path: path.to_string(),
        message: format!("expected an object for `{}`, got {}", field.field, other),
      }),
    }
  }

  /// Key of an embedded list item: edges are keyed by their node so pages
  /// share entries, anything else by position in the full field key.
  #[allow(clippy::too_many_arguments)]
  fn item_key(
    &self,
    field: &FieldSelection,
    selection: &Selection,
    parent: &RecordKey,
    storage_key: &str,
    object: &Map<String, Value>,
    index: &str,
    path: &str,
  ) -> Result<RecordKey> {
    let node = selection
      .fields
      .iter()
      .find(|f| f.field == "node" && !f.embedded && f.selection.is_some());
    if let Some(node_field) = node {
      if let Some(Value::Object(node_object)) = object.get(node_field.response_key()) {
        let node_type = node_object
          .get("__typename")
          .and_then(Value::as_str)
          .unwrap_or(&node_field.type_name);
        let node_path = join_path(path, node_field.response_key());
        let node_key = self.record_key(node_type, node_object, &node_path)?;
        return Ok(RecordKey::new(format!(
          "{}.{}[{}]",
          parent, storage_key, node_key
        )));
      }
    }
    let full_key = full_field_key(field, self.variables);
    Ok(RecordKey::new(format!("{}.{}[{}]", parent, full_key, index)))
  }

  fn record_key(
    &self,
    type_name: &str,
    object: &Map<String, Value>,
    path: &str,
  ) -> Result<RecordKey> {
    let ids = self
      .config
      .keys_for(type_name)
      .into_iter()
      .map(|f| key_value(object, f, type_name, path))
      .collect::<Result<Vec<_>>>()?;
    Ok(RecordKey::keyed(type_name, &ids))
  }

  fn register_list(
    &mut self,
    field: &FieldSelection,
    parent: &RecordKey,
    storage_key: &str,
    link: &Link,
  ) {
    let Some(decl) = &field.list else {
      return;
    };
    let (record, list_field) = if decl.connection {
      match link {
        Link::Record(connection) => (connection.clone(), "edges".to_string()),
        _ => return,
      }
    } else {
      (parent.clone(), storage_key.to_string())
    };
    self.out.lists.push(ListInstance {
      name: decl.name.clone(),
      type_name: decl.type_name.clone(),
      parent: parent.clone(),
      record,
      field: list_field,
      connection: decl.connection,
      arguments: resolved_arguments(field, self.variables, true),
    });
  }

  fn queue_operations(
    &mut self,
    field: &FieldSelection,
    written: &FieldValue,
    raw: &Value,
    path: &str,
  ) -> Result<()> {
    for op in &field.operations {
      let parent = op
        .parent_id
        .as_ref()
        .and_then(|arg| arg.resolve(self.variables))
        .and_then(|v| scalar_string(&v));

      let members: Vec<(RecordKey, Option<String>)> = match op.action {
        ListAction::Delete => {
          let type_name = op.type_name.as_deref().unwrap_or(&field.type_name);
          ids_of(raw)
            .into_iter()
            .map(|id| (RecordKey::keyed(type_name, &[id]), Some(type_name.to_string())))
            .collect()
        }
        _ => match written {
          FieldValue::Link(link) => link
            .keys()
            .into_iter()
            .map(|key| (key.clone(), self.written_type(key)))
            .collect(),
          FieldValue::Scalar(_) => {
            return Err(CacheError::InvalidData {
              path: path.to_string(),
              message: format!("list operations on `{}` need an object value", field.field),
            })
          }
        },
      };

      for (member, member_type) in members {
        self.out.operations.push(PendingListOp {
          action: op.action,
          list: op.list.clone(),
          member,
          member_type,
          position: op.position,
          parent: parent.clone(),
          when: op.when.clone(),
        });
      }
    }
    Ok(())
  }

  /// Type of a record written earlier in this batch, falling back to the
  /// store.
  fn written_type(&self, key: &RecordKey) -> Option<String> {
    self
      .out
      .writes
      .iter()
      .rev()
      .find(|w| &w.key == key && w.type_name.is_some())
      .and_then(|w| w.type_name.clone())
      .or_else(|| self.store.record_type(key).map(str::to_string))
  }
}

fn key_value(
  object: &Map<String, Value>,
  field: &str,
  type_name: &str,
  path: &str,
) -> Result<String> {
  object
    .get(field)
    .and_then(scalar_string)
    .ok_or_else(|| CacheError::Normalization {
      type_name: type_name.to_string(),
      field: field.to_string(),
      path: path.to_string(),
    })
}

fn scalar_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Ids in a `delete` payload: a single id or a list of them.
fn ids_of(value: &Value) -> Vec<String> {
  match value {
    Value::Array(items) => items.iter().flat_map(ids_of).collect(),
    other => scalar_string(other).into_iter().collect(),
  }
}

fn join_path(path: &str, key: &str) -> String {
  if path.is_empty() {
    key.to_string()
  } else {
    format!("{}.{}", path, key)
  }
}
