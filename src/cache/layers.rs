//! Ordered overlays of unconfirmed writes.
//!
//! Layers are consulted top-down at read time; the first layer that defines
//! a field (or deletes its record) wins, otherwise the base store answers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::record::{FieldKey, FieldRef, FieldValue, FieldWrite, RecordKey};
use crate::error::{CacheError, Result};

/// Handle to a layer in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl fmt::Display for LayerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "layer#{}", self.0)
  }
}

/// Field writes one layer holds for one record.
#[derive(Debug, Clone, Default)]
pub struct LayerRecord {
  pub type_name: Option<String>,
  pub fields: HashMap<FieldKey, FieldValue>,
}

/// Result of looking a field up in the layer stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
  Found(&'a FieldValue),
  /// The record was deleted by a layer
  Deleted,
  /// No layer mentions the field
  Absent,
}

#[derive(Debug)]
pub struct Layer {
  pub id: LayerId,
  pub optimistic: bool,
  records: HashMap<RecordKey, LayerRecord>,
  deleted: BTreeSet<RecordKey>,
}

impl Layer {
  fn new(id: LayerId, optimistic: bool) -> Self {
    Self {
      id,
      optimistic,
      records: HashMap::new(),
      deleted: BTreeSet::new(),
    }
  }

  pub fn write(&mut self, write: FieldWrite) {
    self.deleted.remove(&write.key);
    let record = self.records.entry(write.key).or_default();
    if write.type_name.is_some() {
      record.type_name = write.type_name;
    }
    record.fields.insert(write.field, write.value);
  }

  pub fn delete(&mut self, key: &RecordKey) {
    self.records.remove(key);
    self.deleted.insert(key.clone());
  }

  fn lookup(&self, key: &RecordKey, field: &str) -> Lookup<'_> {
    if let Some(record) = self.records.get(key) {
      if let Some(value) = record.fields.get(field) {
        return Lookup::Found(value);
      }
      return Lookup::Absent;
    }
    if self.deleted.contains(key) {
      return Lookup::Deleted;
    }
    Lookup::Absent
  }

  pub fn records(&self) -> impl Iterator<Item = (&RecordKey, &LayerRecord)> {
    self.records.iter()
  }

  pub fn deleted(&self) -> impl Iterator<Item = &RecordKey> {
    self.deleted.iter()
  }

  pub fn record(&self, key: &RecordKey) -> Option<&LayerRecord> {
    self.records.get(key)
  }

  /// Every field this layer writes. Fields of deleted records are not
  /// included.
  pub fn touched(&self) -> BTreeSet<FieldRef> {
    self
      .records
      .iter()
      .flat_map(|(key, record)| {
        record
          .fields
          .keys()
          .map(move |field| FieldRef::new(key.clone(), field.clone()))
      })
      .collect()
  }

  /// Drop writes to `key` and scrub links pointing at it.
  fn scrub(&mut self, key: &RecordKey) {
    self.records.remove(key);
    self.deleted.remove(key);
    for record in self.records.values_mut() {
      for value in record.fields.values_mut() {
        if let FieldValue::Link(link) = value {
          if link.contains(key) {
            *link = link.without(key);
          }
        }
      }
    }
  }
}

/// Stack of layers above the base store, bottom first.
#[derive(Debug, Default)]
pub struct LayerManager {
  layers: Vec<Layer>,
  next_id: u64,
}

impl LayerManager {
  pub fn create(&mut self, optimistic: bool) -> LayerId {
    self.next_id += 1;
    let id = LayerId(self.next_id);
    self.layers.push(Layer::new(id, optimistic));
    id
  }

  pub fn get(&self, id: LayerId) -> Result<&Layer> {
    self
      .layers
      .iter()
      .find(|layer| layer.id == id)
      .ok_or(CacheError::UnknownLayer(id))
  }

  pub fn get_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
    self
      .layers
      .iter_mut()
      .find(|layer| layer.id == id)
      .ok_or(CacheError::UnknownLayer(id))
  }

  pub fn remove(&mut self, id: LayerId) -> Result<Layer> {
    let index = self
      .layers
      .iter()
      .position(|layer| layer.id == id)
      .ok_or(CacheError::UnknownLayer(id))?;
    Ok(self.layers.remove(index))
  }

  pub fn lookup(&self, key: &RecordKey, field: &str) -> Lookup<'_> {
    for layer in self.layers.iter().rev() {
      match layer.lookup(key, field) {
        Lookup::Absent => continue,
        found => return found,
      }
    }
    Lookup::Absent
  }

  /// Whether the layers decide the record's existence: `Some(true)` if the
  /// topmost layer mentioning it holds writes, `Some(false)` if it deleted
  /// it, `None` if no layer mentions it.
  pub fn record_exists(&self, key: &RecordKey) -> Option<bool> {
    for layer in self.layers.iter().rev() {
      if layer.records.contains_key(key) {
        return Some(true);
      }
      if layer.deleted.contains(key) {
        return Some(false);
      }
    }
    None
  }

  pub fn record_type(&self, key: &RecordKey) -> Option<&str> {
    self
      .layers
      .iter()
      .rev()
      .filter_map(|layer| layer.records.get(key))
      .find_map(|record| record.type_name.as_deref())
  }

  /// Union of field keys any layer holds for `key`.
  pub fn fields_of(&self, key: &RecordKey) -> BTreeSet<FieldKey> {
    self
      .layers
      .iter()
      .filter_map(|layer| layer.records.get(key))
      .flat_map(|record| record.fields.keys().cloned())
      .collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Layer> {
    self.layers.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.layers.is_empty()
  }

  pub fn len(&self) -> usize {
    self.layers.len()
  }

  /// Remove every trace of a record that was deleted from the base store.
  pub fn scrub(&mut self, key: &RecordKey) {
    for layer in &mut self.layers {
      layer.scrub(key);
    }
  }
}
