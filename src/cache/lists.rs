//! Named lists that mutations insert into and remove from.
//!
//! The registry only remembers *where* each list instance lives (record and
//! field) and the arguments it was fetched with. Membership itself is the
//! link value in the record store, so every list change is a plain field
//! write and reaches subscribers through the normal notification path.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::record::{escape_id, FieldKey, FieldValue, FieldWrite, Link, RecordKey};
use super::store::RecordStore;
use crate::artifact::{ListPosition, ListWhen};
use crate::error::{CacheError, Result};

/// One concrete occurrence of a named list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListInstance {
  pub name: String,
  /// Declared member type
  pub type_name: String,
  /// Record holding the field the list was declared on
  pub parent: RecordKey,
  /// Record and field holding the member links (the connection record and
  /// its `edges` field for connections)
  pub record: RecordKey,
  pub field: FieldKey,
  pub connection: bool,
  /// Arguments the list was fetched with, pagination excluded
  pub arguments: Map<String, Value>,
}

/// Picks which instances of a named list an operation applies to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListSelector {
  pub name: String,
  /// Parent record key, or the id part of it
  pub parent: Option<String>,
  pub when: Option<ListWhen>,
}

impl ListSelector {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Default::default()
    }
  }

  pub fn parent(mut self, parent: impl Into<String>) -> Self {
    self.parent = Some(parent.into());
    self
  }

  pub fn when(mut self, when: ListWhen) -> Self {
    self.when = Some(when);
    self
  }

  fn matches(&self, instance: &ListInstance) -> bool {
    let parent_ok = self.parent.as_deref().is_none_or(|parent| {
      let key = instance.parent.as_str();
      key == parent
        || key
          .strip_suffix(escape_id(parent).as_str())
          .is_some_and(|prefix| prefix.ends_with(':'))
    });
    let when_ok = self
      .when
      .as_ref()
      .is_none_or(|when| when.matches(&instance.arguments));
    parent_ok && when_ok
  }
}

#[derive(Debug, Default)]
pub struct ListRegistry {
  lists: BTreeMap<String, Vec<ListInstance>>,
}

impl ListRegistry {
  /// Record a list instance. Re-registering the same record/field updates
  /// its arguments.
  pub fn register(&mut self, instance: ListInstance) {
    let entries = self.lists.entry(instance.name.clone()).or_default();
    match entries
      .iter_mut()
      .find(|i| i.record == instance.record && i.field == instance.field)
    {
      Some(existing) => *existing = instance,
      None => entries.push(instance),
    }
  }

  pub fn select(&self, selector: &ListSelector) -> Vec<ListInstance> {
    self
      .lists
      .get(&selector.name)
      .map(|instances| {
        instances
          .iter()
          .filter(|i| selector.matches(i))
          .cloned()
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.lists.contains_key(name)
  }

  /// Drop instances owned by records that no longer exist.
  pub fn forget(&mut self, keys: &BTreeSet<RecordKey>) {
    for instances in self.lists.values_mut() {
      instances.retain(|i| !keys.contains(&i.parent) && !keys.contains(&i.record));
    }
    self.lists.retain(|_, instances| !instances.is_empty());
  }

  pub fn clear(&mut self) {
    self.lists.clear();
  }

  pub fn len(&self) -> usize {
    self.lists.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.lists.is_empty()
  }
}

/// A membership change to apply to one list instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChange {
  Insert(ListPosition),
  Remove,
  /// Flip membership, or force it when a presence is given
  Toggle(ListPosition, Option<bool>),
}

/// Reject members whose type the list does not hold.
pub fn check_member_type(
  instance: &ListInstance,
  member: &RecordKey,
  member_type: Option<&str>,
  possible_types: &BTreeMap<String, BTreeSet<String>>,
) -> Result<()> {
  let actual = member_type.unwrap_or("unknown");
  let ok = actual == instance.type_name
    || possible_types
      .get(&instance.type_name)
      .is_some_and(|types| types.contains(actual));
  if ok {
    Ok(())
  } else {
    Err(CacheError::TypeMismatch {
      list: instance.name.clone(),
      expected: instance.type_name.clone(),
      actual: actual.to_string(),
      record: member.clone(),
    })
  }
}

/// Whether `member` currently belongs to the list instance.
pub fn is_member(store: &RecordStore, instance: &ListInstance, member: &RecordKey) -> bool {
  current_items(store, instance)
    .iter()
    .any(|item| item_member(store, instance, item) == Some(member))
}

/// Field writes that apply `change` for `member`; empty when nothing
/// changes.
pub fn plan_change(
  store: &RecordStore,
  instance: &ListInstance,
  member: &RecordKey,
  change: MemberChange,
) -> Vec<FieldWrite> {
  let present = is_member(store, instance, member);
  let position = match change {
    MemberChange::Insert(position) => Some(position),
    MemberChange::Remove => None,
    MemberChange::Toggle(position, forced) => forced.unwrap_or(!present).then_some(position),
  };
  match position {
    Some(_) if present => Vec::new(),
    Some(position) => plan_insert(store, instance, member, position),
    None if present => plan_remove(store, instance, member),
    None => Vec::new(),
  }
}

fn current_items(store: &RecordStore, instance: &ListInstance) -> Vec<Link> {
  match store.read(&instance.record, &instance.field) {
    Some(FieldValue::Link(Link::List(items))) => items.clone(),
    _ => Vec::new(),
  }
}

/// The member record an item stands for: the item itself, or the `node` of
/// a connection edge.
fn item_member<'a>(
  store: &'a RecordStore,
  instance: &ListInstance,
  item: &'a Link,
) -> Option<&'a RecordKey> {
  let Link::Record(key) = item else {
    return None;
  };
  if !instance.connection {
    return Some(key);
  }
  match store.read(key, "node") {
    Some(FieldValue::Link(Link::Record(node))) => Some(node),
    _ => None,
  }
}

/// Key of the edge wrapping `member` in a connection list.
pub fn edge_key(instance: &ListInstance, member: &RecordKey) -> RecordKey {
  RecordKey::new(format!("{}.{}[{}]", instance.record, instance.field, member))
}

fn list_write(instance: &ListInstance, items: Vec<Link>) -> FieldWrite {
  FieldWrite {
    key: instance.record.clone(),
    type_name: None,
    field: instance.field.clone(),
    value: FieldValue::Link(Link::List(items)),
  }
}

fn plan_insert(
  store: &RecordStore,
  instance: &ListInstance,
  member: &RecordKey,
  position: ListPosition,
) -> Vec<FieldWrite> {
  let mut writes = Vec::new();
  let item = list_item(store, instance, member, &mut writes);

  let mut items = current_items(store, instance);
  match position {
    ListPosition::First => items.insert(0, item),
    ListPosition::Last => items.push(item),
    ListPosition::Index(index) => items.insert(index.min(items.len()), item),
  }
  writes.push(list_write(instance, items));
  writes
}

/// Field writes that set the instance's members to exactly `members`.
pub fn plan_replace(
  store: &RecordStore,
  instance: &ListInstance,
  members: &[RecordKey],
) -> Vec<FieldWrite> {
  let mut writes = Vec::new();
  let items = members
    .iter()
    .map(|member| list_item(store, instance, member, &mut writes))
    .collect();
  writes.push(list_write(instance, items));
  writes
}

/// Link stored in the list for `member`. Connection members are wrapped in
/// an edge record, whose writes are pushed onto `writes`.
fn list_item(
  store: &RecordStore,
  instance: &ListInstance,
  member: &RecordKey,
  writes: &mut Vec<FieldWrite>,
) -> Link {
  if !instance.connection {
    return Link::Record(member.clone());
  }
  let edge = edge_key(instance, member);
  writes.push(FieldWrite {
    key: edge.clone(),
    type_name: None,
    field: "node".to_string(),
    value: FieldValue::Link(Link::Record(member.clone())),
  });
  if store.read(&edge, "cursor").is_none() {
    writes.push(FieldWrite {
      key: edge.clone(),
      type_name: None,
      field: "cursor".to_string(),
      value: FieldValue::Scalar(Value::Null),
    });
  }
  Link::Record(edge)
}

fn plan_remove(store: &RecordStore, instance: &ListInstance, member: &RecordKey) -> Vec<FieldWrite> {
  let items: Vec<Link> = current_items(store, instance)
    .into_iter()
    .filter(|item| item_member(store, instance, item) != Some(member))
    .collect();
  vec![list_write(instance, items)]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::WriteTarget;
  use serde_json::json;

  fn instance(connection: bool) -> ListInstance {
    ListInstance {
      name: "User_Friends".to_string(),
      type_name: "User".to_string(),
      parent: RecordKey::new("User:1"),
      record: if connection {
        RecordKey::new("User:1.friends")
      } else {
        RecordKey::new("User:1")
      },
      field: if connection {
        "edges".to_string()
      } else {
        "friends".to_string()
      },
      connection,
      arguments: json!({ "status": "online" }).as_object().cloned().unwrap(),
    }
  }

  fn apply(store: &mut RecordStore, writes: Vec<FieldWrite>) {
    store.write(writes, WriteTarget::Base).unwrap();
  }

  #[test]
  fn test_selector_matches_parent_and_filters() {
    let mut registry = ListRegistry::default();
    registry.register(instance(false));

    assert_eq!(registry.select(&ListSelector::new("User_Friends")).len(), 1);
    assert_eq!(
      registry
        .select(&ListSelector::new("User_Friends").parent("1"))
        .len(),
      1
    );
    assert_eq!(
      registry
        .select(&ListSelector::new("User_Friends").parent("User:1"))
        .len(),
      1
    );
    assert!(registry
      .select(&ListSelector::new("User_Friends").parent("11"))
      .is_empty());

    let offline = ListWhen {
      must: json!({ "status": "offline" }).as_object().cloned().unwrap(),
      ..Default::default()
    };
    assert!(registry
      .select(&ListSelector::new("User_Friends").when(offline))
      .is_empty());
  }

  #[test]
  fn test_register_same_slot_replaces() {
    let mut registry = ListRegistry::default();
    registry.register(instance(false));
    registry.register(instance(false));
    assert_eq!(registry.len(), 1);

    registry.forget(&[RecordKey::new("User:1")].into_iter().collect());
    assert!(registry.is_empty());
  }

  #[test]
  fn test_type_check() {
    let list = instance(false);
    let member = RecordKey::new("Post:1");
    let mut possible = BTreeMap::new();

    let err = check_member_type(&list, &member, Some("Post"), &possible).unwrap_err();
    assert!(matches!(err, CacheError::TypeMismatch { .. }));

    possible.insert(
      "User".to_string(),
      ["Admin".to_string()].into_iter().collect(),
    );
    assert!(check_member_type(&list, &member, Some("Admin"), &possible).is_ok());
  }

  #[test]
  fn test_insert_remove_toggle_plain_list() {
    let mut store = RecordStore::new(None);
    let list = instance(false);
    let a = RecordKey::new("User:a");
    let b = RecordKey::new("User:b");

    let writes = plan_change(&store, &list, &a, MemberChange::Insert(ListPosition::Last));
    apply(&mut store, writes);
    let writes = plan_change(&store, &list, &b, MemberChange::Insert(ListPosition::First));
    apply(&mut store, writes);
    assert_eq!(
      store.read(&list.record, &list.field),
      Some(&FieldValue::Link(Link::List(vec![
        Link::Record(b.clone()),
        Link::Record(a.clone())
      ])))
    );

    // inserting an existing member is a no-op
    assert!(plan_change(&store, &list, &a, MemberChange::Insert(ListPosition::Last)).is_empty());

    let writes = plan_change(&store, &list, &a, MemberChange::Toggle(ListPosition::Last, None));
    apply(&mut store, writes);
    assert!(!is_member(&store, &list, &a));

    let writes = plan_change(&store, &list, &a, MemberChange::Toggle(ListPosition::Last, None));
    apply(&mut store, writes);
    assert!(is_member(&store, &list, &a));

    assert!(plan_change(
      &store,
      &list,
      &a,
      MemberChange::Toggle(ListPosition::Last, Some(true))
    )
    .is_empty());

    let writes = plan_change(&store, &list, &b, MemberChange::Remove);
    apply(&mut store, writes);
    assert!(!is_member(&store, &list, &b));
  }

  #[test]
  fn test_insert_at_index() {
    let mut store = RecordStore::new(None);
    let list = instance(false);
    for id in ["a", "b"] {
      let writes = plan_change(
        &store,
        &list,
        &RecordKey::new(format!("User:{}", id)),
        MemberChange::Insert(ListPosition::Last),
      );
      apply(&mut store, writes);
    }

    let c = RecordKey::new("User:c");
    let writes = plan_change(&store, &list, &c, MemberChange::Insert(ListPosition::Index(1)));
    apply(&mut store, writes);
    // past the end appends
    let d = RecordKey::new("User:d");
    let writes = plan_change(&store, &list, &d, MemberChange::Toggle(ListPosition::Index(99), None));
    apply(&mut store, writes);

    assert_eq!(
      store.read(&list.record, &list.field),
      Some(&FieldValue::Link(Link::List(
        ["a", "c", "b", "d"]
          .iter()
          .map(|id| Link::Record(RecordKey::new(format!("User:{}", id))))
          .collect()
      )))
    );
  }

  #[test]
  fn test_connection_insert_wraps_member_in_edge() {
    let mut store = RecordStore::new(None);
    let list = instance(true);
    let a = RecordKey::new("User:a");

    let writes = plan_change(&store, &list, &a, MemberChange::Insert(ListPosition::Last));
    apply(&mut store, writes);

    let edge = edge_key(&list, &a);
    assert_eq!(edge.as_str(), "User:1.friends.edges[User:a]");
    assert_eq!(
      store.read(&edge, "node"),
      Some(&FieldValue::Link(Link::Record(a.clone())))
    );
    assert!(is_member(&store, &list, &a));

    let writes = plan_change(&store, &list, &a, MemberChange::Remove);
    apply(&mut store, writes);
    assert!(!is_member(&store, &list, &a));
  }
}
