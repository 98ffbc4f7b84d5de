//! Field-level subscription index and the change sets that drive it.

use std::collections::{BTreeSet, HashMap};

use super::record::{FieldKey, FieldRef, RecordKey};

/// Identifies one cache subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

/// Fields whose effective value changed in one write batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
  pub fields: BTreeSet<FieldRef>,
  /// Records that no longer exist after the batch
  pub deleted: BTreeSet<RecordKey>,
}

impl ChangeSet {
  pub fn is_empty(&self) -> bool {
    self.fields.is_empty() && self.deleted.is_empty()
  }

  pub fn extend(&mut self, other: ChangeSet) {
    self.fields.extend(other.fields);
    self.deleted.extend(other.deleted);
  }

  pub fn contains(&self, key: &str, field: &str) -> bool {
    self
      .fields
      .iter()
      .any(|f| f.key.as_str() == key && f.field == field)
  }
}

/// Maps `(record, field)` pairs to the subscribers that read them.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
  by_record: HashMap<RecordKey, HashMap<FieldKey, BTreeSet<SubscriberId>>>,
  by_subscriber: HashMap<SubscriberId, BTreeSet<FieldRef>>,
}

impl SubscriptionIndex {
  /// Replace the set of fields `id` depends on.
  pub fn replace(&mut self, id: SubscriberId, fields: BTreeSet<FieldRef>) {
    self.remove(id);
    for field in &fields {
      self
        .by_record
        .entry(field.key.clone())
        .or_default()
        .entry(field.field.clone())
        .or_default()
        .insert(id);
    }
    self.by_subscriber.insert(id, fields);
  }

  pub fn remove(&mut self, id: SubscriberId) {
    let Some(fields) = self.by_subscriber.remove(&id) else {
      return;
    };
    for field in fields {
      if let Some(record) = self.by_record.get_mut(&field.key) {
        if let Some(subscribers) = record.get_mut(&field.field) {
          subscribers.remove(&id);
          if subscribers.is_empty() {
            record.remove(&field.field);
          }
        }
        if record.is_empty() {
          self.by_record.remove(&field.key);
        }
      }
    }
  }

  /// Subscribers affected by a change set, each listed once.
  pub fn affected(&self, changes: &ChangeSet) -> BTreeSet<SubscriberId> {
    let mut out = BTreeSet::new();
    for field in &changes.fields {
      if let Some(subscribers) = self
        .by_record
        .get(&field.key)
        .and_then(|record| record.get(&field.field))
      {
        out.extend(subscribers.iter().copied());
      }
    }
    for key in &changes.deleted {
      if let Some(record) = self.by_record.get(key) {
        out.extend(record.values().flatten().copied());
      }
    }
    out
  }

  pub fn is_subscribed(&self, key: &RecordKey) -> bool {
    self.by_record.contains_key(key)
  }

  pub fn subscribed_records(&self) -> impl Iterator<Item = &RecordKey> {
    self.by_record.keys()
  }

  pub fn fields_of(&self, id: SubscriberId) -> Option<&BTreeSet<FieldRef>> {
    self.by_subscriber.get(&id)
  }

  pub fn len(&self) -> usize {
    self.by_subscriber.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_subscriber.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn field(key: &str, field: &str) -> FieldRef {
    FieldRef::new(RecordKey::new(key), field)
  }

  #[test]
  fn test_batched_subscribers_listed_once() {
    let mut index = SubscriptionIndex::default();
    let id = SubscriberId(1);
    index.replace(
      id,
      [field("User:1", "name"), field("User:1", "age")]
        .into_iter()
        .collect(),
    );

    let mut changes = ChangeSet::default();
    changes.fields.insert(field("User:1", "name"));
    changes.fields.insert(field("User:1", "age"));

    assert_eq!(index.affected(&changes).len(), 1);
  }

  #[test]
  fn test_deleted_record_reaches_every_field_subscriber() {
    let mut index = SubscriptionIndex::default();
    index.replace(SubscriberId(1), [field("User:1", "name")].into_iter().collect());
    index.replace(SubscriberId(2), [field("User:1", "age")].into_iter().collect());

    let mut changes = ChangeSet::default();
    changes.deleted.insert(RecordKey::new("User:1"));

    let affected = index.affected(&changes);
    assert_eq!(affected.len(), 2);
  }

  #[test]
  fn test_replace_drops_old_interest() {
    let mut index = SubscriptionIndex::default();
    let id = SubscriberId(7);
    index.replace(id, [field("User:1", "name")].into_iter().collect());
    index.replace(id, [field("User:2", "name")].into_iter().collect());

    assert!(!index.is_subscribed(&RecordKey::new("User:1")));
    assert!(index.is_subscribed(&RecordKey::new("User:2")));

    index.remove(id);
    assert!(index.is_empty());
    assert!(!index.is_subscribed(&RecordKey::new("User:2")));
  }
}
