//! Error taxonomy for cache, document and pagination operations.

use std::fmt;

use thiserror::Error;

use crate::cache::{LayerId, RecordKey};

/// Direction of a page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageDirection {
  Forward,
  Backward,
}

impl fmt::Display for PageDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PageDirection::Forward => f.write_str("forward"),
      PageDirection::Backward => f.write_str("backward"),
    }
  }
}

/// Errors surfaced by the cache engine.
///
/// Validation-class variants (`Normalization`, `TypeMismatch`, `InvalidData`,
/// `UnknownList`) are raised before any shared state is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  /// A keyed record in the payload is missing one of its key fields.
  #[error("cannot normalize {type_name} at `{path}`: missing key field `{field}`")]
  Normalization {
    type_name: String,
    field: String,
    path: String,
  },

  /// A list operation targeted a record whose type the list does not hold.
  #[error("list `{list}` holds {expected} but {record} is a {actual}")]
  TypeMismatch {
    list: String,
    expected: String,
    actual: String,
    record: RecordKey,
  },

  /// A page load in the same direction is still in flight.
  #[error("a {0} page load is already in flight")]
  AlreadyLoading(PageDirection),

  /// Page info says there is nothing more to load in that direction.
  #[error("no {0} page available")]
  NoMorePages(PageDirection),

  /// The transport rejected the request.
  #[error("transport failed: {0}")]
  Transport(String),

  #[error("unknown layer {0}")]
  UnknownLayer(LayerId),

  #[error("document `{0}` is not paginated")]
  NotPaginated(String),

  /// Response data does not match the shape of the selection.
  #[error("invalid data at `{path}`: {message}")]
  InvalidData { path: String, message: String },

  #[error("no list named `{0}` has been registered")]
  UnknownList(String),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
