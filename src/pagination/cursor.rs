use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Map, Value};
use tracing::info;

use super::page_info::{count_items, PageInfo};
use super::LoadingGuard;
use crate::artifact::{CachePolicy, PaginationMethod, RefetchSpec, UpdateMode};
use crate::config::PaginationConfig;
use crate::document::{DocumentState, DocumentStore, SendParams};
use crate::error::{CacheError, PageDirection, Result};

/// Cursor (Relay connection) pagination over one document.
///
/// Pages are loaded through sibling stores that write into the cache with
/// `append`/`prepend` updates; the wrapped document sees the merged list
/// through its cache subscription.
pub struct CursorPaginator {
  document: DocumentStore,
  forward: DocumentStore,
  backward: DocumentStore,
  refetch: RefetchSpec,
  page_size: usize,
  loading_next: AtomicBool,
  loading_previous: AtomicBool,
}

impl CursorPaginator {
  pub fn new(document: DocumentStore) -> Result<Self> {
    Self::with_config(document, &PaginationConfig::default())
  }

  /// Like [`CursorPaginator::new`]; documents without their own page size
  /// use `config.default_page_size`.
  pub fn with_config(document: DocumentStore, config: &PaginationConfig) -> Result<Self> {
    let artifact = document.artifact();
    let refetch = artifact
      .pagination()
      .filter(|r| r.method == PaginationMethod::Cursor)
      .cloned()
      .ok_or_else(|| CacheError::NotPaginated(artifact.name.clone()))?;
    Ok(Self {
      forward: document.sibling(),
      backward: document.sibling(),
      document,
      page_size: refetch.page_size.unwrap_or(config.default_page_size),
      refetch,
      loading_next: AtomicBool::new(false),
      loading_previous: AtomicBool::new(false),
    })
  }

  pub fn document(&self) -> &DocumentStore {
    &self.document
  }

  /// Page info of the document's current data.
  pub fn page_info(&self) -> PageInfo {
    match &self.document.state().data {
      Some(data) => PageInfo::extract(data, &self.refetch.path),
      None => PageInfo::default(),
    }
  }

  pub fn is_loading_next(&self) -> bool {
    self.loading_next.load(Ordering::SeqCst)
  }

  pub fn is_loading_previous(&self) -> bool {
    self.loading_previous.load(Ordering::SeqCst)
  }

  /// Load the page after `endCursor` and append it.
  pub async fn load_next_page(&self, count: Option<usize>) -> Result<DocumentState> {
    let _guard = LoadingGuard::acquire(&self.loading_next, PageDirection::Forward)?;
    let info = self.page_info();
    if !info.has_next_page {
      return Err(CacheError::NoMorePages(PageDirection::Forward));
    }
    let first = count.unwrap_or(self.page_size);
    let variables = self.page_variables(&[
      ("first", json!(first)),
      ("after", json!(info.end_cursor)),
    ]);
    info!(document = %self.document.artifact().name, first, "loading next page");
    self
      .forward
      .send(
        SendParams::default()
          .variables(variables)
          .policy(CachePolicy::NetworkOnly)
          .apply_updates([UpdateMode::Append]),
      )
      .await?;
    Ok(self.document.state())
  }

  /// Load the page before `startCursor` and prepend it.
  pub async fn load_previous_page(&self, count: Option<usize>) -> Result<DocumentState> {
    let _guard = LoadingGuard::acquire(&self.loading_previous, PageDirection::Backward)?;
    let info = self.page_info();
    if !info.has_previous_page {
      return Err(CacheError::NoMorePages(PageDirection::Backward));
    }
    let last = count.unwrap_or(self.page_size);
    let variables = self.page_variables(&[
      ("last", json!(last)),
      ("before", json!(info.start_cursor)),
    ]);
    info!(document = %self.document.artifact().name, last, "loading previous page");
    self
      .backward
      .send(
        SendParams::default()
          .variables(variables)
          .policy(CachePolicy::NetworkOnly)
          .apply_updates([UpdateMode::Prepend]),
      )
      .await?;
    Ok(self.document.state())
  }

  /// Reload the document. New variables start the list over; without them
  /// every loaded item is fetched again in one request.
  pub async fn refetch(&self, variables: Option<Map<String, Value>>) -> Result<DocumentState> {
    let variables = match variables {
      Some(variables) => variables,
      None => {
        let loaded = self
          .document
          .state()
          .data
          .map_or(0, |data| count_items(&data, &self.refetch.path));
        self.page_variables(&[("first", json!(loaded.max(self.page_size)))])
      }
    };
    self
      .document
      .send(
        SendParams::default()
          .variables(variables)
          .policy(CachePolicy::NetworkOnly),
      )
      .await
  }

  /// The document's variables with the cursor arguments replaced.
  fn page_variables(&self, overrides: &[(&str, Value)]) -> Map<String, Value> {
    let mut variables = self.document.variables();
    for name in ["first", "after", "last", "before"] {
      variables.remove(name);
    }
    for (name, value) in overrides {
      variables.insert((*name).to_string(), value.clone());
    }
    variables
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Cache;
  use crate::transport::{Transport, TransportRequest, TransportResponse};
  use std::sync::Arc;

  #[test]
  fn test_rejects_unpaginated_document() {
    let artifact = Arc::new(
      serde_json::from_value(json!({
        "name": "Viewer",
        "kind": "query",
        "selection": { "fields": [] }
      }))
      .unwrap(),
    );
    let transport: Arc<dyn Transport> = Arc::new(|_: TransportRequest| async {
      Ok::<_, color_eyre::Report>(TransportResponse::default())
    });
    let store = DocumentStore::new(artifact, Cache::default(), transport, Map::new());

    let err = CursorPaginator::new(store).err().unwrap();
    assert_eq!(err, CacheError::NotPaginated("Viewer".to_string()));
  }

  #[tokio::test]
  async fn test_no_next_page_before_first_load() {
    let artifact = Arc::new(
      serde_json::from_value(json!({
        "name": "Feed",
        "kind": "query",
        "selection": { "fields": [] },
        "refetch": { "paginated": true, "method": "cursor", "path": ["feed"], "pageSize": 5 }
      }))
      .unwrap(),
    );
    let transport: Arc<dyn Transport> = Arc::new(|_: TransportRequest| async {
      Ok::<_, color_eyre::Report>(TransportResponse::default())
    });
    let store = DocumentStore::new(artifact, Cache::default(), transport, Map::new());
    let paginator = CursorPaginator::new(store).unwrap();

    let err = paginator.load_next_page(None).await.unwrap_err();
    assert_eq!(err, CacheError::NoMorePages(PageDirection::Forward));
    assert!(!paginator.is_loading_next());
  }
}
