use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::info;

use super::page_info::count_json_items;
use super::LoadingGuard;
use crate::artifact::{CachePolicy, PaginationMethod, RefetchSpec, UpdateMode};
use crate::config::PaginationConfig;
use crate::document::{DocumentState, DocumentStore, SendParams};
use crate::error::{CacheError, PageDirection, Result};

#[derive(Debug, Clone, Copy)]
struct Window {
  offset: usize,
  limit: usize,
  has_more: bool,
}

/// Offset/limit pagination over one document. Pages are always appended.
///
/// Whether more items exist is guessed: a page that came back full means
/// there may be more. A final page that is exactly full reads as "more".
pub struct OffsetPaginator {
  document: DocumentStore,
  sibling: DocumentStore,
  refetch: RefetchSpec,
  page_size: usize,
  loading: AtomicBool,
  window: Mutex<Window>,
}

impl OffsetPaginator {
  pub fn new(document: DocumentStore) -> Result<Self> {
    Self::with_config(document, &PaginationConfig::default())
  }

  pub fn with_config(document: DocumentStore, config: &PaginationConfig) -> Result<Self> {
    let artifact = document.artifact();
    let refetch = artifact
      .pagination()
      .filter(|r| r.method == PaginationMethod::Offset)
      .cloned()
      .ok_or_else(|| CacheError::NotPaginated(artifact.name.clone()))?;
    let page_size = refetch.page_size.unwrap_or(config.default_page_size);
    let window = initial_window(&document.variables(), page_size);
    Ok(Self {
      sibling: document.sibling(),
      document,
      page_size,
      refetch,
      loading: AtomicBool::new(false),
      window: Mutex::new(window),
    })
  }

  pub fn document(&self) -> &DocumentStore {
    &self.document
  }

  pub fn is_loading_next(&self) -> bool {
    self.loading.load(Ordering::SeqCst)
  }

  /// Offset the next page will start at.
  pub fn next_offset(&self) -> usize {
    let window = self.window.lock();
    window.offset + window.limit
  }

  /// Whether the last page came back full.
  pub fn has_more(&self) -> bool {
    self.window.lock().has_more
  }

  /// Fetch `limit` items (the page size by default) after the last loaded
  /// page and append them.
  pub async fn load_next_page(&self, limit: Option<usize>) -> Result<DocumentState> {
    let _guard = LoadingGuard::acquire(&self.loading, PageDirection::Forward)?;
    let offset = self.next_offset();
    let limit = limit.unwrap_or(self.page_size);

    let mut variables = self.document.variables();
    variables.insert("offset".to_string(), json!(offset));
    variables.insert("limit".to_string(), json!(limit));
    info!(document = %self.document.artifact().name, offset, limit, "loading next page");

    self
      .sibling
      .send(
        SendParams::default()
          .variables(variables)
          .policy(CachePolicy::NetworkOnly)
          .apply_updates([UpdateMode::Append]),
      )
      .await?;

    let returned = self
      .sibling
      .last_response()
      .and_then(|response| response.data)
      .map_or(0, |data| count_json_items(&data, &self.refetch.path));
    *self.window.lock() = Window {
      offset,
      limit,
      has_more: returned == limit,
    };
    Ok(self.document.state())
  }

  /// Reload the document from scratch, with new variables if given.
  pub async fn refetch(&self, variables: Option<Map<String, Value>>) -> Result<DocumentState> {
    let mut params = SendParams::default().policy(CachePolicy::NetworkOnly);
    if let Some(variables) = variables {
      params = params.variables(variables);
    }
    let state = self.document.send(params).await?;
    *self.window.lock() = initial_window(&state.variables, self.page_size);
    Ok(state)
  }
}

fn initial_window(variables: &Map<String, Value>, page_size: usize) -> Window {
  let number = |name: &str| {
    variables
      .get(name)
      .and_then(Value::as_u64)
      .map(|n| n as usize)
  };
  Window {
    offset: number("offset").unwrap_or(0),
    limit: number("limit").unwrap_or(page_size),
    has_more: true,
  }
}
