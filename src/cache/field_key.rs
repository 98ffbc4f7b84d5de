//! Storage keys for fields.
//!
//! A field key is the schema field name followed by its resolved arguments,
//! sorted by name: `friends(filter: "x", first: 10)`. Arguments bound to
//! unset variables are left out.

use serde_json::{Map, Value};

use super::record::FieldKey;
use crate::artifact::FieldSelection;

/// Arguments that select a page rather than a different list.
pub const PAGINATION_ARGS: [&str; 6] = ["first", "after", "last", "before", "offset", "limit"];

/// Key the field is stored under. Paginated fields drop their pagination
/// arguments so every page lands in the same slot.
pub fn field_key(field: &FieldSelection, variables: &Map<String, Value>) -> FieldKey {
  render(&field.field, &resolved_arguments(field, variables, field.paginated))
}

/// Key including every argument, pagination included.
pub fn full_field_key(field: &FieldSelection, variables: &Map<String, Value>) -> FieldKey {
  render(&field.field, &resolved_arguments(field, variables, false))
}

/// Argument values after variable substitution, sorted by name.
pub fn resolved_arguments(
  field: &FieldSelection,
  variables: &Map<String, Value>,
  strip_pagination: bool,
) -> Map<String, Value> {
  field
    .arguments
    .iter()
    .filter(|(name, _)| !(strip_pagination && PAGINATION_ARGS.contains(&name.as_str())))
    .filter_map(|(name, arg)| arg.resolve(variables).map(|value| (name.clone(), value)))
    .collect()
}

fn render(name: &str, arguments: &Map<String, Value>) -> FieldKey {
  if arguments.is_empty() {
    return name.to_string();
  }
  let args: Vec<String> = arguments
    .iter()
    .map(|(name, value)| format!("{}: {}", name, value))
    .collect();
  format!("{}({})", name, args.join(", "))
}
