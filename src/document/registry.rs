//! Shared document stores keyed by document and variables.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::DocumentStore;
use crate::artifact::Artifact;
use crate::cache::Cache;
use crate::transport::Transport;

/// Stable key for a document and its variables. Object keys are serialized
/// in sorted order, so equal variable maps hash the same.
pub fn document_key(name: &str, variables: &Map<String, Value>) -> String {
  let canonical = Value::Object(variables.clone()).to_string();
  let mut hasher = Sha256::new();
  hasher.update(name.as_bytes());
  hasher.update(b":");
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}

struct Entry {
  store: DocumentStore,
  holders: usize,
}

/// Hands out one [`DocumentStore`] per (document, variables) pair and keeps
/// it alive while anyone holds it.
pub struct DocumentRegistry {
  cache: Cache,
  transport: Arc<dyn Transport>,
  documents: Mutex<HashMap<String, Entry>>,
}

impl DocumentRegistry {
  pub fn new(cache: Cache, transport: Arc<dyn Transport>) -> Self {
    Self {
      cache,
      transport,
      documents: Mutex::new(HashMap::new()),
    }
  }

  pub fn cache(&self) -> &Cache {
    &self.cache
  }

  /// Store for the document, created on first use.
  pub fn acquire(&self, artifact: Arc<Artifact>, variables: Map<String, Value>) -> DocumentStore {
    let key = document_key(&artifact.name, &variables);
    let mut documents = self.documents.lock();
    let entry = documents.entry(key).or_insert_with(|| {
      debug!(document = %artifact.name, "creating document store");
      Entry {
        store: DocumentStore::new(
          artifact.clone(),
          self.cache.clone(),
          self.transport.clone(),
          variables,
        ),
        holders: 0,
      }
    });
    entry.holders += 1;
    entry.store.clone()
  }

  /// Give back one hold. Returns true when it was the last one and the
  /// store stopped watching the cache.
  pub fn release(&self, artifact: &Artifact, variables: &Map<String, Value>) -> bool {
    let key = document_key(&artifact.name, variables);
    let mut documents = self.documents.lock();
    let Some(entry) = documents.get_mut(&key) else {
      return false;
    };
    entry.holders = entry.holders.saturating_sub(1);
    if entry.holders > 0 {
      return false;
    }
    if let Some(entry) = documents.remove(&key) {
      entry.store.close();
      debug!(document = %artifact.name, "released document store");
    }
    true
  }

  /// Number of live stores.
  pub fn len(&self) -> usize {
    self.documents.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.documents.lock().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::SendParams;
  use crate::transport::{TransportRequest, TransportResponse};
  use serde_json::json;

  fn artifact() -> Arc<Artifact> {
    Arc::new(
      serde_json::from_value(json!({
        "name": "Viewer",
        "kind": "query",
        "selection": { "fields": [{
          "field": "viewer",
          "type": "User",
          "selection": { "fields": [{ "field": "id", "type": "ID" }] }
        }] }
      }))
      .unwrap(),
    )
  }

  fn registry() -> DocumentRegistry {
    let transport: Arc<dyn Transport> = Arc::new(|_: TransportRequest| async {
      Ok::<_, color_eyre::Report>(TransportResponse::data(json!({ "viewer": { "id": "1" } })))
    });
    DocumentRegistry::new(Cache::default(), transport)
  }

  #[test]
  fn test_document_key_ignores_insertion_order() {
    let mut a = Map::new();
    a.insert("first".into(), json!(10));
    a.insert("after".into(), json!("x"));
    let mut b = Map::new();
    b.insert("after".into(), json!("x"));
    b.insert("first".into(), json!(10));

    assert_eq!(document_key("Q", &a), document_key("Q", &b));
    assert_ne!(document_key("Q", &a), document_key("R", &a));
    assert_eq!(document_key("Q", &a).len(), 64);
  }

  #[tokio::test]
  async fn test_acquire_shares_and_release_unsubscribes() {
    let registry = registry();
    let artifact = artifact();

    let first = registry.acquire(artifact.clone(), Map::new());
    let second = registry.acquire(artifact.clone(), Map::new());
    assert_eq!(registry.len(), 1);

    first.send(SendParams::default()).await.unwrap();
    assert!(second.state().data.is_some());
    assert_eq!(registry.cache().subscriber_count(), 1);

    assert!(!registry.release(&artifact, &Map::new()));
    assert!(registry.release(&artifact, &Map::new()));
    assert!(registry.is_empty());
    assert_eq!(registry.cache().subscriber_count(), 0);
    assert!(!registry.release(&artifact, &Map::new()));
  }
}
