//! Static document descriptors produced by the document compiler.
//!
//! The engine treats an [`Artifact`] as read-only input and never validates
//! its internal consistency. Artifacts are plain serde data so they can be
//! loaded straight from the JSON the compiler emits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What kind of document an artifact describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
  Query,
  Mutation,
  Fragment,
  Subscription,
}

/// Decides whether the cache is consulted before the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
  /// Serve a complete cache hit, go to the network otherwise
  #[default]
  CacheFirst,
  /// Serve whatever the cache has, then always refresh from the network
  CacheAndNetwork,
  /// Skip the cache lookup
  NetworkOnly,
  /// Never touch the network
  CacheOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationMethod {
  Cursor,
  Offset,
}

/// Where new list entries go when a paged result is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
  Append,
  Prepend,
}

/// Compiled document descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
  pub name: String,
  pub kind: ArtifactKind,
  /// Type the top-level selection applies to (`Query`, `Mutation`, or the
  /// fragment's type condition)
  #[serde(default = "default_root_type")]
  pub root_type: String,
  pub selection: Selection,
  #[serde(default)]
  pub refetch: Option<RefetchSpec>,
  /// Whether partial cache hits may be shown without waiting on the network
  #[serde(default)]
  pub partial: bool,
  #[serde(default)]
  pub policy: Option<CachePolicy>,
}

fn default_root_type() -> String {
  "Query".to_string()
}

impl Artifact {
  /// Pagination settings, if this document pages through a list.
  pub fn pagination(&self) -> Option<&RefetchSpec> {
    self.refetch.as_ref().filter(|r| r.paginated)
  }
}

/// Refetch / pagination metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefetchSpec {
  pub paginated: bool,
  pub method: PaginationMethod,
  /// Response path from the root of the result to the paginated field
  pub path: Vec<String>,
  /// Omitted when the document leaves it to `pagination.default_page_size`
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub page_size: Option<usize>,
}

/// A selection set: fields that always apply plus fields that only apply for
/// a given concrete `__typename`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
  #[serde(default)]
  pub fields: Vec<FieldSelection>,
  #[serde(default)]
  pub abstract_fields: BTreeMap<String, Vec<FieldSelection>>,
}

impl Selection {
  /// Fields that apply to an object of the given type.
  pub fn fields_for<'a>(
    &'a self,
    type_name: Option<&'a str>,
  ) -> impl Iterator<Item = &'a FieldSelection> + 'a {
    let extra = type_name
      .and_then(|t| self.abstract_fields.get(t))
      .map(|fields| fields.as_slice())
      .unwrap_or(&[]);
    self.fields.iter().chain(extra.iter())
  }
}

/// One selected field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelection {
  /// Response key, when it differs from the schema field name
  #[serde(default)]
  pub alias: Option<String>,
  pub field: String,
  /// Named type of the field (list wrappers stripped)
  #[serde(rename = "type")]
  pub type_name: String,
  #[serde(default = "default_nullable")]
  pub nullable: bool,
  #[serde(default)]
  pub arguments: BTreeMap<String, Argument>,
  #[serde(default)]
  pub selection: Option<Selection>,
  /// The field's type has no key fields; objects are keyed by path
  #[serde(default)]
  pub embedded: bool,
  /// Pagination arguments are left out of the storage key
  #[serde(default)]
  pub paginated: bool,
  /// Update modes this field takes part in when a paged write is merged
  #[serde(default)]
  pub updates: Vec<UpdateMode>,
  #[serde(default)]
  pub list: Option<ListDeclaration>,
  #[serde(default)]
  pub operations: Vec<ListOperation>,
  /// Variable that must be true for the field to be selected (`@include`)
  #[serde(default)]
  pub include: Option<String>,
  /// Variable that must be false for the field to be selected (`@skip`)
  #[serde(default)]
  pub skip: Option<String>,
}

fn default_nullable() -> bool {
  true
}

impl FieldSelection {
  pub fn response_key(&self) -> &str {
    self.alias.as_deref().unwrap_or(&self.field)
  }

  /// Evaluate `@include` / `@skip` against the operation variables.
  pub fn is_selected(&self, variables: &Map<String, Value>) -> bool {
    let flag = |name: &String| variables.get(name).and_then(Value::as_bool);
    if let Some(include) = &self.include {
      if flag(include) != Some(true) {
        return false;
      }
    }
    if let Some(skip) = &self.skip {
      if flag(skip) == Some(true) {
        return false;
      }
    }
    true
  }
}

/// Argument value: either an inline literal or a reference to a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Argument {
  Value(Value),
  Variable(String),
}

impl Argument {
  /// Resolve against the operation variables. Unset variables resolve to
  /// `None`, which means the argument is absent.
  pub fn resolve(&self, variables: &Map<String, Value>) -> Option<Value> {
    match self {
      Argument::Value(v) => Some(v.clone()),
      Argument::Variable(name) => variables.get(name).cloned(),
    }
  }
}

/// Declares the field as a named list that mutations can target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDeclaration {
  pub name: String,
  /// Type of the list members
  #[serde(rename = "type")]
  pub type_name: String,
  /// Members live under `edges { node }` of a connection object
  #[serde(default)]
  pub connection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListAction {
  Insert,
  Remove,
  Toggle,
  Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListPosition {
  First,
  #[default]
  Last,
  /// Before the item currently at this index; past the end appends.
  Index(usize),
}

/// A mutation-time operation applied to the record written at this field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOperation {
  pub action: ListAction,
  /// Target list name (unused by `delete`)
  #[serde(default)]
  pub list: Option<String>,
  /// Record type to delete (only used by `delete`)
  #[serde(default, rename = "type")]
  pub type_name: Option<String>,
  #[serde(default)]
  pub position: ListPosition,
  /// Only lists under this parent record id are affected
  #[serde(default)]
  pub parent_id: Option<Argument>,
  #[serde(default)]
  pub when: Option<ListWhen>,
}

/// Argument filters a list instance must (not) have been fetched with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWhen {
  #[serde(default)]
  pub must: Map<String, Value>,
  #[serde(default)]
  pub must_not: Map<String, Value>,
}

impl ListWhen {
  /// Whether a list fetched with `arguments` satisfies the filter.
  pub fn matches(&self, arguments: &Map<String, Value>) -> bool {
    let must = self
      .must
      .iter()
      .all(|(k, v)| arguments.get(k) == Some(v));
    let must_not = self
      .must_not
      .iter()
      .all(|(k, v)| arguments.get(k) != Some(v));
    must && must_not
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_deserialize_compiled_artifact() {
    let artifact: Artifact = serde_json::from_value(json!({
      "name": "UserFriends",
      "kind": "query",
      "selection": {
        "fields": [{
          "field": "user",
          "type": "User",
          "arguments": { "id": { "variable": "id" } },
          "selection": {
            "fields": [
              { "field": "id", "type": "ID", "nullable": false },
              { "field": "name", "type": "String" }
            ]
          }
        }]
      },
      "refetch": {
        "paginated": true,
        "method": "cursor",
        "path": ["user", "friends"],
        "pageSize": 10
      }
    }))
    .unwrap();

    assert_eq!(artifact.kind, ArtifactKind::Query);
    assert_eq!(artifact.root_type, "Query");
    assert!(artifact.pagination().is_some());
    let user = &artifact.selection.fields[0];
    assert_eq!(user.response_key(), "user");
    assert!(user.nullable);
    assert_eq!(
      user.arguments.get("id"),
      Some(&Argument::Variable("id".to_string()))
    );
    assert!(!user.selection.as_ref().unwrap().fields[0].nullable);
  }

  #[test]
  fn test_include_and_skip_conditions() {
    let field: FieldSelection = serde_json::from_value(json!({
      "field": "email",
      "type": "String",
      "include": "withEmail",
      "skip": "anonymous"
    }))
    .unwrap();

    let vars = |v: Value| v.as_object().cloned().unwrap();
    assert!(field.is_selected(&vars(json!({ "withEmail": true }))));
    assert!(!field.is_selected(&vars(json!({}))));
    assert!(!field.is_selected(&vars(json!({ "withEmail": true, "anonymous": true }))));
  }

  #[test]
  fn test_abstract_fields_apply_by_typename() {
    let selection: Selection = serde_json::from_value(json!({
      "fields": [{ "field": "id", "type": "ID" }],
      "abstractFields": {
        "Cat": [{ "field": "lives", "type": "Int" }]
      }
    }))
    .unwrap();

    assert_eq!(selection.fields_for(Some("Cat")).count(), 2);
    assert_eq!(selection.fields_for(Some("Dog")).count(), 1);
    assert_eq!(selection.fields_for(None).count(), 1);
  }

  #[test]
  fn test_list_when_filters() {
    let when = ListWhen {
      must: json!({ "status": "open" }).as_object().cloned().unwrap(),
      must_not: json!({ "archived": true }).as_object().cloned().unwrap(),
    };
    let args = |v: Value| v.as_object().cloned().unwrap();
    assert!(when.matches(&args(json!({ "status": "open" }))));
    assert!(!when.matches(&args(json!({ "status": "closed" }))));
    assert!(!when.matches(&args(json!({ "status": "open", "archived": true }))));
  }

  #[test]
  fn test_list_positions_parse() {
    let parse = |v: Value| serde_json::from_value::<ListPosition>(v).unwrap();
    assert_eq!(parse(json!("first")), ListPosition::First);
    assert_eq!(parse(json!("last")), ListPosition::Last);
    assert_eq!(parse(json!({ "index": 2 })), ListPosition::Index(2));
  }
}
