//! Base record storage with the layer stack and subscription index on top.
//!
//! Every mutation goes through [`RecordStore::write`], [`RecordStore::delete`]
//! or the layer resolution methods, and each of them returns the
//! [`ChangeSet`] of fields whose *effective* value changed, computed by
//! comparing the effective view before and after the batch.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::layers::{Layer, LayerId, LayerManager, Lookup};
use super::record::{FieldEntry, FieldRef, FieldValue, FieldWrite, Link, Record, RecordKey};
use super::subscriptions::{ChangeSet, SubscriptionIndex};
use crate::artifact::UpdateMode;
use crate::error::Result;

/// Where a write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
  Base,
  Layer(LayerId),
}

impl From<Option<LayerId>> for WriteTarget {
  fn from(layer: Option<LayerId>) -> Self {
    layer.map_or(WriteTarget::Base, WriteTarget::Layer)
  }
}

type Snapshot = Vec<(FieldRef, Option<FieldValue>)>;

#[derive(Debug)]
pub struct RecordStore {
  base: HashMap<RecordKey, Record>,
  pub(crate) layers: LayerManager,
  pub(crate) subscriptions: SubscriptionIndex,
  generation: u64,
  stale_after: Option<Duration>,
}

impl RecordStore {
  pub fn new(stale_after: Option<Duration>) -> Self {
    Self {
      base: HashMap::new(),
      layers: LayerManager::default(),
      subscriptions: SubscriptionIndex::default(),
      generation: 0,
      stale_after,
    }
  }

  /// Effective value of a field: topmost layer first, then the base store.
  pub fn read(&self, key: &RecordKey, field: &str) -> Option<&FieldValue> {
    match self.layers.lookup(key, field) {
      Lookup::Found(value) => Some(value),
      Lookup::Deleted => None,
      Lookup::Absent => self
        .base
        .get(key)
        .and_then(|record| record.fields.get(field))
        .map(|entry| &entry.value),
    }
  }

  /// Whether the record exists in the effective view.
  pub fn exists(&self, key: &RecordKey) -> bool {
    self
      .layers
      .record_exists(key)
      .unwrap_or_else(|| self.base.contains_key(key))
  }

  pub fn record_type<'a>(&'a self, key: &'a RecordKey) -> Option<&'a str> {
    self
      .layers
      .record_type(key)
      .or_else(|| self.base.get(key).and_then(|r| r.type_name.as_deref()))
      .or_else(|| key.type_prefix())
  }

  /// Base-store fields are stale when explicitly marked or older than the
  /// configured age. Layer values are never stale.
  pub fn is_stale(&self, key: &RecordKey, field: &str, now: DateTime<Utc>) -> bool {
    if !matches!(self.layers.lookup(key, field), Lookup::Absent) {
      return false;
    }
    let Some(entry) = self.base.get(key).and_then(|r| r.fields.get(field)) else {
      return false;
    };
    entry.stale
      || self
        .stale_after
        .is_some_and(|age| now - entry.written_at > age)
  }

  pub fn write(&mut self, writes: Vec<FieldWrite>, target: WriteTarget) -> Result<ChangeSet> {
    if let WriteTarget::Layer(id) = target {
      self.layers.get(id)?;
    }
    let refs: BTreeSet<FieldRef> = writes
      .iter()
      .map(|w| FieldRef::new(w.key.clone(), w.field.clone()))
      .collect();
    let before = self.snapshot(refs);
    let now = Utc::now();
    for write in writes {
      match target {
        WriteTarget::Base => self.write_base(write, now),
        WriteTarget::Layer(id) => self.layers.get_mut(id)?.write(write),
      }
    }
    Ok(self.diff(before))
  }

  fn write_base(&mut self, write: FieldWrite, now: DateTime<Utc>) {
    self.generation += 1;
    let generation = self.generation;
    if let FieldValue::Link(link) = &write.value {
      for target in link.keys() {
        if let Some(record) = self.base.get_mut(target) {
          record.generation = generation;
        }
      }
    }
    let record = self
      .base
      .entry(write.key)
      .or_insert_with(|| Record::new(None, generation));
    if write.type_name.is_some() {
      record.type_name = write.type_name;
    }
    record.generation = generation;
    record.fields.insert(
      write.field,
      FieldEntry {
        value: write.value,
        written_at: now,
        stale: false,
      },
    );
  }

  /// Remove a record. In the base store every link to it is scrubbed; in a
  /// layer it is hidden until the layer goes away. Connection edges whose
  /// `node` is the record go with it. Fields linking to any removed record
  /// are always reported as changed.
  pub fn delete(&mut self, key: &RecordKey, target: WriteTarget) -> Result<ChangeSet> {
    if let WriteTarget::Layer(id) = target {
      self.layers.get(id)?;
    }
    if !self.exists(key) {
      return Ok(ChangeSet::default());
    }
    let mut doomed = vec![key.clone()];
    doomed.extend(self.edges_of(key));

    let mut referencing = BTreeSet::new();
    let mut refs = BTreeSet::new();
    for key in &doomed {
      referencing.extend(self.referencing(key));
      refs.extend(self.fields_of(key));
    }
    refs.extend(referencing.iter().cloned());
    let before = self.snapshot(refs);

    for key in &doomed {
      match target {
        WriteTarget::Base => self.delete_base(key),
        WriteTarget::Layer(id) => self.layers.get_mut(id)?.delete(key),
      }
    }

    let mut changes = self.diff(before);
    changes.fields.extend(referencing);
    for key in doomed {
      if !self.exists(&key) {
        changes.deleted.insert(key);
      }
    }
    Ok(changes)
  }

  /// Connection edge records (`parent.edges[...]`) wrapping `key`.
  fn edges_of(&self, key: &RecordKey) -> Vec<RecordKey> {
    let node = FieldValue::Link(Link::Record(key.clone()));
    self
      .referencing(key)
      .into_iter()
      .filter(|r| r.field == "node" && r.key.as_str().ends_with(']'))
      .map(|r| r.key)
      .filter(|edge| self.exists(edge) && self.read(edge, "node") == Some(&node))
      .collect()
  }

  fn delete_base(&mut self, key: &RecordKey) {
    self.base.remove(key);
    self.layers.scrub(key);
    self.generation += 1;
    let generation = self.generation;
    for record in self.base.values_mut() {
      let mut touched = false;
      for entry in record.fields.values_mut() {
        if let FieldValue::Link(link) = &mut entry.value {
          if link.contains(key) {
            *link = link.without(key);
            touched = true;
          }
        }
      }
      if touched {
        record.generation = generation;
      }
    }
    debug!(record = %key, "deleted record");
  }

  pub fn create_layer(&mut self, optimistic: bool) -> LayerId {
    self.layers.create(optimistic)
  }

  pub fn write_layer(&mut self, id: LayerId, writes: Vec<FieldWrite>) -> Result<ChangeSet> {
    self.write(writes, WriteTarget::Layer(id))
  }

  /// Merge a layer into the base store and remove it. When `replacement` is
  /// given the layer's own writes are dropped and the replacement lands in
  /// the base store instead.
  pub fn resolve_layer(
    &mut self,
    id: LayerId,
    replacement: Option<Vec<FieldWrite>>,
  ) -> Result<ChangeSet> {
    let (mut refs, referencing) = self.layer_refs(self.layers.get(id)?);
    if let Some(writes) = &replacement {
      refs.extend(
        writes
          .iter()
          .map(|w| FieldRef::new(w.key.clone(), w.field.clone())),
      );
    }
    refs.extend(referencing.iter().cloned());
    let before = self.snapshot(refs);
    let layer = self.layers.remove(id)?;

    let (writes, deletes) = match replacement {
      Some(writes) => (writes, Vec::new()),
      None => layer_contents(&layer),
    };
    let now = Utc::now();
    for write in writes {
      self.write_base(write, now);
    }
    for key in &deletes {
      self.delete_base(key);
    }

    let mut changes = self.diff(before);
    changes.fields.extend(referencing);
    changes
      .deleted
      .extend(deletes.into_iter().filter(|k| !self.exists(k)));
    debug!(layer = %id, changed = changes.fields.len(), "resolved layer");
    Ok(changes)
  }

  /// Drop a layer without applying it.
  pub fn discard_layer(&mut self, id: LayerId) -> Result<ChangeSet> {
    let (mut refs, referencing) = self.layer_refs(self.layers.get(id)?);
    refs.extend(referencing.iter().cloned());
    let before = self.snapshot(refs);
    self.layers.remove(id)?;
    let mut changes = self.diff(before);
    changes.fields.extend(referencing);
    debug!(layer = %id, changed = changes.fields.len(), "discarded layer");
    Ok(changes)
  }

  /// Fields a layer shadows, plus the fields that link to records it deleted.
  fn layer_refs(&self, layer: &Layer) -> (BTreeSet<FieldRef>, BTreeSet<FieldRef>) {
    let mut refs = layer.touched();
    let mut referencing = BTreeSet::new();
    for key in layer.deleted() {
      refs.extend(self.fields_of(key));
      referencing.extend(self.referencing(key));
    }
    (refs, referencing)
  }

  /// Every field slot any storage level holds for `key`.
  fn fields_of(&self, key: &RecordKey) -> BTreeSet<FieldRef> {
    let mut fields = self.layers.fields_of(key);
    if let Some(record) = self.base.get(key) {
      fields.extend(record.fields.keys().cloned());
    }
    fields
      .into_iter()
      .map(|field| FieldRef::new(key.clone(), field))
      .collect()
  }

  /// Fields at any storage level whose value links to `key`.
  pub fn referencing(&self, key: &RecordKey) -> BTreeSet<FieldRef> {
    let mut out = BTreeSet::new();
    for (owner, record) in &self.base {
      for (field, entry) in &record.fields {
        if entry.value.references(key) {
          out.insert(FieldRef::new(owner.clone(), field.clone()));
        }
      }
    }
    for layer in self.layers.iter() {
      for (owner, record) in layer.records() {
        for (field, value) in &record.fields {
          if value.references(key) {
            out.insert(FieldRef::new(owner.clone(), field.clone()));
          }
        }
      }
    }
    out
  }

  fn snapshot(&self, refs: BTreeSet<FieldRef>) -> Snapshot {
    refs
      .into_iter()
      .map(|r| {
        let value = self.read(&r.key, &r.field).cloned();
        (r, value)
      })
      .collect()
  }

  fn diff(&self, before: Snapshot) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (field, old) in before {
      if self.read(&field.key, &field.field) != old.as_ref() {
        changes.fields.insert(field);
      }
    }
    changes
  }

  /// Mark base-store fields stale. `None` for the type matches every record;
  /// `None` for the field matches every field. A field name matches all of
  /// its argument variants.
  pub fn mark_stale(&mut self, type_name: Option<&str>, field: Option<&str>) -> usize {
    let mut marked = 0;
    for (key, record) in &mut self.base {
      let type_matches = type_name.is_none_or(|t| {
        record.type_name.as_deref() == Some(t) || key.type_prefix() == Some(t)
      });
      if type_matches {
        marked += mark_fields(record, field);
      }
    }
    marked
  }

  pub fn mark_record_stale(&mut self, key: &RecordKey, field: Option<&str>) -> usize {
    self
      .base
      .get_mut(key)
      .map_or(0, |record| mark_fields(record, field))
  }

  /// Keys linked from `key` at any storage level.
  pub fn links_from(&self, key: &RecordKey) -> Vec<RecordKey> {
    let mut out = Vec::new();
    if let Some(record) = self.base.get(key) {
      for entry in record.fields.values() {
        if let FieldValue::Link(link) = &entry.value {
          out.extend(link.keys().into_iter().cloned());
        }
      }
    }
    for layer in self.layers.iter() {
      if let Some(record) = layer.record(key) {
        for value in record.fields.values() {
          if let FieldValue::Link(link) = value {
            out.extend(link.keys().into_iter().cloned());
          }
        }
      }
    }
    out
  }

  /// Records any layer writes to, deletes, or links to.
  pub fn layer_pinned(&self) -> HashSet<RecordKey> {
    let mut out = HashSet::new();
    for layer in self.layers.iter() {
      out.extend(layer.deleted().cloned());
      for (key, record) in layer.records() {
        out.insert(key.clone());
        for value in record.fields.values() {
          if let FieldValue::Link(link) = value {
            out.extend(link.keys().into_iter().cloned());
          }
        }
      }
    }
    out
  }

  pub fn base(&self) -> &HashMap<RecordKey, Record> {
    &self.base
  }

  /// Remove an unreachable record without notification.
  pub(crate) fn evict(&mut self, key: &RecordKey) -> bool {
    self.base.remove(key).is_some()
  }

  /// Insert a record restored from a snapshot, merging into any record
  /// already present.
  pub(crate) fn restore_record(&mut self, key: RecordKey, restored: Record) -> BTreeSet<FieldRef> {
    self.generation += 1;
    let generation = self.generation;
    let record = self
      .base
      .entry(key.clone())
      .or_insert_with(|| Record::new(None, generation));
    if restored.type_name.is_some() {
      record.type_name = restored.type_name;
    }
    record.generation = generation;
    let mut touched = BTreeSet::new();
    for (field, entry) in restored.fields {
      touched.insert(FieldRef::new(key.clone(), field.clone()));
      record.fields.insert(field, entry);
    }
    touched
  }

  /// Drop every record and layer. Subscriptions survive.
  pub(crate) fn clear(&mut self) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (key, record) in self.base.drain() {
      changes.fields.extend(
        record
          .fields
          .into_keys()
          .map(|field| FieldRef::new(key.clone(), field)),
      );
      changes.deleted.insert(key);
    }
    self.layers = LayerManager::default();
    changes
  }

  pub fn len(&self) -> usize {
    self.base.len()
  }

  pub fn is_empty(&self) -> bool {
    self.base.is_empty()
  }
}

fn mark_fields(record: &mut Record, field: Option<&str>) -> usize {
  let mut marked = 0;
  for (key, entry) in &mut record.fields {
    if field.is_none_or(|name| field_matches(key, name)) {
      entry.stale = true;
      marked += 1;
    }
  }
  marked
}

fn field_matches(field_key: &str, name: &str) -> bool {
  field_key
    .strip_prefix(name)
    .is_some_and(|rest| rest.is_empty() || rest.starts_with('('))
}

fn layer_contents(layer: &Layer) -> (Vec<FieldWrite>, Vec<RecordKey>) {
  let writes = layer
    .records()
    .flat_map(|(key, record)| {
      record.fields.iter().map(move |(field, value)| FieldWrite {
        key: key.clone(),
        type_name: record.type_name.clone(),
        field: field.clone(),
        value: value.clone(),
      })
    })
    .collect();
  (writes, layer.deleted().cloned().collect())
}

/// Merge an incoming page of links into the existing list. Entries already
/// present are dropped from the old list so they take the position of the
/// new page; the new page goes at the end (`Append`) or start (`Prepend`).
pub fn merge_links(existing: Option<&FieldValue>, incoming: Link, mode: UpdateMode) -> Link {
  let Some(FieldValue::Link(Link::List(old))) = existing else {
    return incoming;
  };
  let new = match incoming {
    Link::List(new) => new,
    other => return other,
  };
  let incoming_keys: HashSet<&RecordKey> = new
    .iter()
    .filter_map(|item| match item {
      Link::Record(key) => Some(key),
      _ => None,
    })
    .collect();
  let retained = old
    .iter()
    .filter(|item| !matches!(item, Link::Record(key) if incoming_keys.contains(key)))
    .cloned();
  let merged: Vec<Link> = match mode {
    UpdateMode::Append => retained.chain(new.iter().cloned()).collect(),
    UpdateMode::Prepend => new.iter().cloned().chain(retained).collect(),
  };
  Link::List(merged)
}
