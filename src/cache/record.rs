//! Normalized record representation.
//!
//! Records never point at each other directly: links hold [`RecordKey`]s and
//! the record store is the sole owner of record data, so reference cycles
//! are just keys.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage slot of a field: name plus canonicalized arguments.
pub type FieldKey = String;

/// Percent-escapes the characters record keys are built from (`:` between
/// key parts, `.` before embedded fields, `[`/`]` around list items).
pub fn escape_id(id: &str) -> String {
  let mut out = String::with_capacity(id.len());
  for c in id.chars() {
    match c {
      '%' => out.push_str("%25"),
      ':' => out.push_str("%3A"),
      '.' => out.push_str("%2E"),
      '[' => out.push_str("%5B"),
      ']' => out.push_str("%5D"),
      c => out.push(c),
    }
  }
  out
}

/// Stable identity of a normalized record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
  pub const ROOT: &'static str = "_ROOT_";

  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  /// The record holding top-level query, mutation and subscription fields.
  pub fn root() -> Self {
    Self(Self::ROOT.to_string())
  }

  /// Key for an entity with key fields, e.g. `User:1`. Id parts are passed
  /// through [`escape_id`] so they never contain key separators.
  pub fn keyed(type_name: &str, ids: &[String]) -> Self {
    let ids: Vec<String> = ids.iter().map(|id| escape_id(id)).collect();
    Self(format!("{}:{}", type_name, ids.join(":")))
  }

  /// Key for an identity-less object embedded under `parent`.
  pub fn embedded(parent: &RecordKey, field: &str) -> Self {
    Self(format!("{}.{}", parent.0, field))
  }

  pub fn is_root(&self) -> bool {
    self.0 == Self::ROOT
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Type prefix of a keyed record (`User` for `User:1`). Embedded keys have
  /// no type prefix.
  pub fn type_prefix(&self) -> Option<&str> {
    if self.0.contains('.') {
      return None;
    }
    self.0.split_once(':').map(|(t, _)| t)
  }
}

impl fmt::Display for RecordKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for RecordKey {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

/// A reference field: null, one record, or a (possibly nested) list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
  Null,
  Record(RecordKey),
  List(Vec<Link>),
}

impl Link {
  /// Every record key mentioned by this link, in order.
  pub fn keys(&self) -> Vec<&RecordKey> {
    let mut out = Vec::new();
    self.collect_keys(&mut out);
    out
  }

  fn collect_keys<'a>(&'a self, out: &mut Vec<&'a RecordKey>) {
    match self {
      Link::Null => {}
      Link::Record(key) => out.push(key),
      Link::List(items) => items.iter().for_each(|item| item.collect_keys(out)),
    }
  }

  pub fn contains(&self, key: &RecordKey) -> bool {
    match self {
      Link::Null => false,
      Link::Record(k) => k == key,
      Link::List(items) => items.iter().any(|item| item.contains(key)),
    }
  }

  /// Copy of this link with `key` scrubbed out: single references become
  /// null, list entries are dropped.
  pub fn without(&self, key: &RecordKey) -> Link {
    match self {
      Link::Record(k) if k == key => Link::Null,
      Link::List(items) => Link::List(
        items
          .iter()
          .filter(|item| !matches!(item, Link::Record(k) if k == key))
          .map(|item| item.without(key))
          .collect(),
      ),
      other => other.clone(),
    }
  }
}

/// Value stored in a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldValue {
  /// Scalars, enums, lists of scalars and custom scalar objects
  Scalar(Value),
  Link(Link),
}

impl FieldValue {
  pub fn as_link(&self) -> Option<&Link> {
    match self {
      FieldValue::Link(link) => Some(link),
      FieldValue::Scalar(_) => None,
    }
  }

  pub fn references(&self, key: &RecordKey) -> bool {
    self.as_link().is_some_and(|link| link.contains(key))
  }
}

/// A field slot in the base store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
  pub value: FieldValue,
  pub written_at: DateTime<Utc>,
  #[serde(default)]
  pub stale: bool,
}

/// Base-store record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  pub type_name: Option<String>,
  pub fields: HashMap<FieldKey, FieldEntry>,
  /// Bumped by every write touching or linking to this record
  pub generation: u64,
}

impl Record {
  pub fn new(type_name: Option<String>, generation: u64) -> Self {
    Self {
      type_name,
      fields: HashMap::new(),
      generation,
    }
  }
}

/// Address of one field of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
  pub key: RecordKey,
  pub field: FieldKey,
}

impl FieldRef {
  pub fn new(key: RecordKey, field: impl Into<FieldKey>) -> Self {
    Self {
      key,
      field: field.into(),
    }
  }
}

/// One normalized field write.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
  pub key: RecordKey,
  pub type_name: Option<String>,
  pub field: FieldKey,
  pub value: FieldValue,
}
