use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::ResponseValue;

/// Connection page info as read from a document's data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
  pub has_next_page: bool,
  pub has_previous_page: bool,
  pub start_cursor: Option<String>,
  pub end_cursor: Option<String>,
}

impl PageInfo {
  /// Read `pageInfo` under the connection at `path`. Missing or unknown
  /// fields read as false / no cursor.
  pub fn extract<S: AsRef<str>>(data: &ResponseValue, path: &[S]) -> Self {
    let Some(info) = data.at_path(path).and_then(|c| c.get("pageInfo")) else {
      return Self::default();
    };
    let flag = |name: &str| info.get(name).and_then(ResponseValue::as_bool).unwrap_or(false);
    let cursor = |name: &str| {
      info
        .get(name)
        .and_then(ResponseValue::as_str)
        .map(str::to_string)
    };
    Self {
      has_next_page: flag("hasNextPage"),
      has_previous_page: flag("hasPreviousPage"),
      start_cursor: cursor("startCursor"),
      end_cursor: cursor("endCursor"),
    }
  }
}

/// Number of items loaded at `path`: the edges of a connection, or the
/// entries of a plain list.
pub fn count_items<S: AsRef<str>>(data: &ResponseValue, path: &[S]) -> usize {
  let Some(target) = data.at_path(path) else {
    return 0;
  };
  target
    .get("edges")
    .unwrap_or(target)
    .as_list()
    .map_or(0, <[ResponseValue]>::len)
}

/// [`count_items`] over a raw response payload.
pub fn count_json_items<S: AsRef<str>>(data: &Value, path: &[S]) -> usize {
  let target = path
    .iter()
    .try_fold(data, |value, key| value.get(key.as_ref()));
  let Some(target) = target else {
    return 0;
  };
  target
    .get("edges")
    .unwrap_or(target)
    .as_array()
    .map_or(0, Vec::len)
}
