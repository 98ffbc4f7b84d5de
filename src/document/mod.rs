//! Per-document observers.
//!
//! A [`DocumentStore`] owns the fetch lifecycle of one artifact: it decides
//! per cache policy whether to answer from the cache, the network or both,
//! writes network results through the [`Cache`], and keeps its state in
//! sync with the cache afterwards by watching every field its last read
//! touched.
//!
//! # Example
//!
//! ```ignore
//! let store = DocumentStore::new(artifact, cache.clone(), transport, Map::new());
//! let mut updates = store.subscribe();
//!
//! let state = store.send(SendParams::default()).await?;
//! render(&state);
//!
//! // later cache writes from other documents show up here
//! while updates.changed().await.is_ok() {
//!     render(&updates.borrow());
//! }
//! ```

pub mod registry;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::artifact::{Artifact, ArtifactKind, CachePolicy, UpdateMode};
use crate::cache::{Cache, LayerId, ReadResult, RecordKey, SubscriberId, WriteRequest};
use crate::error::{CacheError, Result};
use crate::transport::{GraphQLError, Transport, TransportRequest, TransportResponse};
use crate::value::ResponseValue;

pub use registry::{document_key, DocumentRegistry};
pub use state::{DataSource, DocumentState, FetchPhase};

/// Options for one [`DocumentStore::send`].
#[derive(Debug, Clone, Default)]
pub struct SendParams {
  /// Replaces the document's variables; the current ones are reused when
  /// absent
  pub variables: Option<Map<String, Value>>,
  pub policy: Option<CachePolicy>,
  pub metadata: Option<Value>,
  /// Merge paged lists instead of replacing them
  pub apply_updates: Vec<UpdateMode>,
  /// Written to an optimistic layer until the real response lands
  pub optimistic_response: Option<Value>,
}

impl SendParams {
  pub fn variables(mut self, variables: Map<String, Value>) -> Self {
    self.variables = Some(variables);
    self
  }

  pub fn policy(mut self, policy: CachePolicy) -> Self {
    self.policy = Some(policy);
    self
  }

  pub fn metadata(mut self, metadata: Value) -> Self {
    self.metadata = Some(metadata);
    self
  }

  pub fn apply_updates(mut self, modes: impl IntoIterator<Item = UpdateMode>) -> Self {
    self.apply_updates = modes.into_iter().collect();
    self
  }

  pub fn optimistic(mut self, response: Value) -> Self {
    self.optimistic_response = Some(response);
    self
  }
}

struct DocumentInner {
  artifact: Arc<Artifact>,
  cache: Cache,
  transport: Arc<dyn Transport>,
  /// Record fragment documents read from
  parent: Option<RecordKey>,
  disable_subscriptions: bool,
  state: watch::Sender<DocumentState>,
  sequence: AtomicU64,
  subscription: Mutex<Option<SubscriberId>>,
  last_response: Mutex<Option<TransportResponse>>,
  /// Latest cache notification that arrived during a fetch
  deferred: Mutex<Option<ReadResult>>,
}

impl DocumentInner {
  /// Cache notifications only touch data while no fetch is in flight; the
  /// latest one is held back until the fetch ends.
  fn on_cache_change(&self, result: &ReadResult) {
    self.state.send_if_modified(|state| {
      if state.fetching {
        *self.deferred.lock() = Some(result.clone());
        return false;
      }
      state.data = Some(result.data.clone());
      state.partial = result.partial;
      state.stale = result.stale;
      true
    });
  }

  fn take_deferred(&self, state: &mut DocumentState) {
    if let Some(result) = self.deferred.lock().take() {
      state.data = Some(result.data);
      state.partial = result.partial;
      state.stale = result.stale;
    }
  }

  /// End a fetch in error. Prior data stays, brought up to date with any
  /// cache change held back while the fetch ran.
  fn fail(&self, errors: Vec<GraphQLError>) {
    self.state.send_modify(|state| {
      state.fail(errors);
      self.take_deferred(state);
    });
  }
}

impl Drop for DocumentInner {
  fn drop(&mut self) {
    if let Some(id) = self.subscription.get_mut().take() {
      self.cache.unsubscribe(id);
    }
  }
}

/// Observer for one document; clones share state.
#[derive(Clone)]
pub struct DocumentStore {
  inner: Arc<DocumentInner>,
}

impl DocumentStore {
  pub fn new(
    artifact: Arc<Artifact>,
    cache: Cache,
    transport: Arc<dyn Transport>,
    variables: Map<String, Value>,
  ) -> Self {
    Self::build(artifact, cache, transport, variables, None, false)
  }

  /// Observer for a fragment spread on `parent`. Fragments are only ever
  /// read from the cache.
  pub fn fragment(
    artifact: Arc<Artifact>,
    cache: Cache,
    transport: Arc<dyn Transport>,
    parent: RecordKey,
    variables: Map<String, Value>,
  ) -> Self {
    Self::build(artifact, cache, transport, variables, Some(parent), false)
  }

  fn build(
    artifact: Arc<Artifact>,
    cache: Cache,
    transport: Arc<dyn Transport>,
    variables: Map<String, Value>,
    parent: Option<RecordKey>,
    disable_subscriptions: bool,
  ) -> Self {
    let (state, _) = watch::channel(DocumentState::new(variables));
    Self {
      inner: Arc::new(DocumentInner {
        artifact,
        cache,
        transport,
        parent,
        disable_subscriptions,
        state,
        sequence: AtomicU64::new(0),
        subscription: Mutex::new(None),
        last_response: Mutex::new(None),
        deferred: Mutex::new(None),
      }),
    }
  }

  /// Observer for the same document that never watches the cache. Used to
  /// run page loads whose results reach the original through the cache.
  pub fn sibling(&self) -> Self {
    Self::build(
      self.inner.artifact.clone(),
      self.inner.cache.clone(),
      self.inner.transport.clone(),
      self.variables(),
      self.inner.parent.clone(),
      true,
    )
  }

  pub fn artifact(&self) -> &Arc<Artifact> {
    &self.inner.artifact
  }

  pub fn cache(&self) -> &Cache {
    &self.inner.cache
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> DocumentState {
    self.inner.state.borrow().clone()
  }

  pub fn variables(&self) -> Map<String, Value> {
    self.inner.state.borrow().variables.clone()
  }

  /// Receiver that sees every state change.
  pub fn subscribe(&self) -> watch::Receiver<DocumentState> {
    self.inner.state.subscribe()
  }

  /// Raw payload of the last applied network response.
  pub fn last_response(&self) -> Option<TransportResponse> {
    self.inner.last_response.lock().clone()
  }

  /// Stop watching the cache.
  pub fn close(&self) {
    if let Some(id) = self.inner.subscription.lock().take() {
      self.inner.cache.unsubscribe(id);
    }
  }

  /// Load the document.
  ///
  /// Resolves with the cache result when the policy allows answering from
  /// the cache, otherwise with the network result. `cache-and-network` and
  /// stale `cache-first` hits keep fetching in the background and update
  /// the state when the response lands.
  pub async fn send(&self, params: SendParams) -> Result<DocumentState> {
    let artifact = &self.inner.artifact;
    let variables = params
      .variables
      .clone()
      .unwrap_or_else(|| self.variables());
    let seq = self.next_sequence();

    if artifact.kind == ArtifactKind::Fragment {
      let cached = self.read_cache(&variables);
      return Ok(self.apply_cache(cached, variables, false));
    }

    let policy = match artifact.kind {
      ArtifactKind::Query => params
        .policy
        .or(artifact.policy)
        .unwrap_or(self.inner.cache.config().default_policy),
      _ => CachePolicy::NetworkOnly,
    };

    if policy != CachePolicy::NetworkOnly {
      let cached = self.read_cache(&variables);
      let complete = !cached.partial;
      let usable = complete || (artifact.partial && has_data(&cached.data));
      match policy {
        CachePolicy::CacheOnly => return Ok(self.apply_cache(cached, variables, false)),
        CachePolicy::CacheFirst if complete && !cached.stale => {
          return Ok(self.apply_cache(cached, variables, false));
        }
        CachePolicy::CacheFirst if complete => {
          info!(document = %artifact.name, "revalidating stale cache hit");
          return Ok(self.answer_then_fetch(cached, seq, variables, params));
        }
        CachePolicy::CacheAndNetwork if usable => {
          return Ok(self.answer_then_fetch(cached, seq, variables, params));
        }
        _ if usable => {
          // partial data is shown while the network result is awaited
          self.inner.state.send_modify(|state| {
            state.data = Some(cached.data);
            state.partial = true;
            state.source = Some(DataSource::Cache);
          });
        }
        _ => {}
      }
    }

    self.fetch(seq, variables, params).await
  }

  /// Apply each payload of an externally driven response stream (a
  /// subscription) as a network result, until the stream ends or fails.
  pub async fn listen<S>(&self, mut stream: S) -> Result<()>
  where
    S: Stream<Item = color_eyre::Result<TransportResponse>> + Unpin,
  {
    let variables = self.variables();
    self
      .inner
      .state
      .send_modify(|state| state.start_fetch(variables.clone()));
    while let Some(payload) = stream.next().await {
      let seq = self.next_sequence();
      self.apply_result(seq, &variables, &[], None, payload)?;
    }
    Ok(())
  }

  fn next_sequence(&self) -> u64 {
    self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn parent(&self) -> RecordKey {
    self.inner.parent.clone().unwrap_or_else(RecordKey::root)
  }

  fn read_cache(&self, variables: &Map<String, Value>) -> ReadResult {
    self
      .inner
      .cache
      .read_at(&self.inner.artifact, variables, &self.parent())
  }

  fn apply_cache(
    &self,
    cached: ReadResult,
    variables: Map<String, Value>,
    fetching: bool,
  ) -> DocumentState {
    self.resubscribe(&variables);
    self.inner.deferred.lock().take();
    self.inner.state.send_modify(|state| {
      state.variables = variables;
      state.settle(cached.data, DataSource::Cache);
      state.partial = cached.partial;
      state.stale = cached.stale;
      self.inner.take_deferred(state);
      if fetching {
        state.fetching = true;
        state.phase = FetchPhase::Fetching;
      }
    });
    self.state()
  }

  fn answer_then_fetch(
    &self,
    cached: ReadResult,
    seq: u64,
    variables: Map<String, Value>,
    params: SendParams,
  ) -> DocumentState {
    let state = self.apply_cache(cached, variables.clone(), true);
    let this = self.clone();
    tokio::spawn(async move {
      if let Err(err) = this.fetch(seq, variables, params).await {
        warn!(document = %this.inner.artifact.name, error = %err, "background fetch failed");
      }
    });
    state
  }

  async fn fetch(
    &self,
    seq: u64,
    variables: Map<String, Value>,
    params: SendParams,
  ) -> Result<DocumentState> {
    let artifact = self.inner.artifact.clone();
    self
      .inner
      .state
      .send_modify(|state| state.start_fetch(variables.clone()));
    info!(document = %artifact.name, sequence = seq, "sending document");

    let layer = match &params.optimistic_response {
      Some(optimistic) => match self.write_optimistic(optimistic, &variables) {
        Ok(layer) => Some(layer),
        Err(err) => {
          self.inner.fail(vec![GraphQLError::new(err.to_string())]);
          return Err(err);
        }
      },
      None => None,
    };

    let request = TransportRequest {
      artifact,
      variables: variables.clone(),
      metadata: params.metadata.clone(),
    };
    let result = self.inner.transport.execute(request).await;
    self.apply_result(seq, &variables, &params.apply_updates, layer, result)
  }

  fn write_optimistic(&self, data: &Value, variables: &Map<String, Value>) -> Result<LayerId> {
    let cache = &self.inner.cache;
    let layer = cache.create_layer(true);
    let request = WriteRequest::new(&self.inner.artifact, data)
      .variables(variables)
      .layer(layer);
    if let Err(err) = cache.write(request) {
      self.discard(Some(layer));
      return Err(err);
    }
    Ok(layer)
  }

  fn discard(&self, layer: Option<LayerId>) {
    if let Some(id) = layer {
      if let Err(err) = self.inner.cache.discard_layer(id) {
        warn!(layer = %id, error = %err, "failed to discard optimistic layer");
      }
    }
  }

  /// Fold one transport outcome into the cache and the state. Outcomes of
  /// superseded requests are dropped.
  fn apply_result(
    &self,
    seq: u64,
    variables: &Map<String, Value>,
    apply_updates: &[UpdateMode],
    layer: Option<LayerId>,
    result: color_eyre::Result<TransportResponse>,
  ) -> Result<DocumentState> {
    let artifact = &self.inner.artifact;
    if self.inner.sequence.load(Ordering::SeqCst) != seq {
      warn!(document = %artifact.name, sequence = seq, "discarding superseded response");
      self.discard(layer);
      return Ok(self.state());
    }

    let response = match result {
      Ok(response) => response,
      Err(report) => {
        let message = report.to_string();
        warn!(document = %artifact.name, error = %message, "transport failed");
        self.discard(layer);
        self.inner.fail(vec![GraphQLError::new(message.clone())]);
        return Err(CacheError::Transport(message));
      }
    };
    *self.inner.last_response.lock() = Some(response.clone());

    let Some(data) = &response.data else {
      warn!(document = %artifact.name, errors = response.errors.len(), "response carried no data");
      self.discard(layer);
      self.inner.fail(response.errors.clone());
      return Ok(self.state());
    };

    let mut request = WriteRequest::new(artifact, data)
      .variables(variables)
      .apply_updates(apply_updates.iter().copied());
    if let Some(parent) = &self.inner.parent {
      request = request.parent(parent.clone());
    }
    let written = match layer {
      Some(id) => self.inner.cache.resolve_layer(id, Some(request)),
      None => self.inner.cache.write(request),
    };
    if let Err(err) = written {
      self.discard(layer);
      self.inner.fail(vec![GraphQLError::new(err.to_string())]);
      return Err(err);
    }

    let watches_cache = matches!(artifact.kind, ArtifactKind::Query | ArtifactKind::Fragment);
    // watch first so changes landing after the read below still arrive
    let (value, partial, stale) = if watches_cache {
      self.resubscribe(variables);
      self.inner.deferred.lock().take();
      let read = self.read_cache(variables);
      (read.data, read.partial, read.stale)
    } else {
      (ResponseValue::from_json(data), false, false)
    };
    self.inner.state.send_modify(|state| {
      state.variables = variables.clone();
      state.settle(value, DataSource::Network);
      state.errors = response.errors.clone();
      state.partial = partial;
      state.stale = stale;
      self.inner.take_deferred(state);
    });
    info!(document = %artifact.name, sequence = seq, "document settled");
    Ok(self.state())
  }

  /// Watch the fields of the read for `variables`, replacing the previous
  /// watch.
  fn resubscribe(&self, variables: &Map<String, Value>) {
    let inner = &self.inner;
    if inner.disable_subscriptions
      || !matches!(inner.artifact.kind, ArtifactKind::Query | ArtifactKind::Fragment)
    {
      return;
    }
    let weak = Arc::downgrade(inner);
    let id = inner.cache.subscribe_at(
      inner.artifact.clone(),
      variables.clone(),
      self.parent(),
      move |result: &ReadResult| {
        if let Some(inner) = weak.upgrade() {
          inner.on_cache_change(result);
        }
      },
    );
    let previous = inner.subscription.lock().replace(id);
    if let Some(old) = previous {
      inner.cache.unsubscribe(old);
    }
  }
}

fn has_data(value: &ResponseValue) -> bool {
  match value {
    ResponseValue::Object(map) => map.values().any(|v| !v.is_unknown()),
    other => !other.is_unknown(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn user_artifact() -> Arc<Artifact> {
    Arc::new(
      serde_json::from_value(json!({
        "name": "UserInfo",
        "kind": "query",
        "selection": { "fields": [{
          "field": "user",
          "type": "User",
          "arguments": { "id": { "variable": "id" } },
          "selection": { "fields": [
            { "field": "id", "type": "ID" },
            { "field": "name", "type": "String" }
          ] }
        }] }
      }))
      .unwrap(),
    )
  }

  fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
  }

  /// Answers every request with a user named after the call count.
  fn counting_transport(calls: Arc<AtomicUsize>) -> Arc<dyn Transport> {
    Arc::new(move |req: TransportRequest| {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
        let id = req.variables.get("id").cloned().unwrap_or(json!("1"));
        Ok::<_, color_eyre::Report>(TransportResponse::data(json!({
          "user": { "id": id, "name": format!("call {}", n) }
        })))
      }
    })
  }

  #[tokio::test]
  async fn test_cache_first_uses_cache_after_first_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::default();
    let store = DocumentStore::new(
      user_artifact(),
      cache.clone(),
      counting_transport(calls.clone()),
      vars(json!({ "id": "1" })),
    );

    let first = store.send(SendParams::default()).await.unwrap();
    assert_eq!(first.phase, FetchPhase::Settled);
    assert_eq!(first.source, Some(DataSource::Network));

    let second = store.send(SendParams::default()).await.unwrap();
    assert_eq!(second.source, Some(DataSource::Cache));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_only_miss_is_partial_without_network() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = DocumentStore::new(
      user_artifact(),
      Cache::default(),
      counting_transport(calls.clone()),
      vars(json!({ "id": "1" })),
    );

    let state = store
      .send(SendParams::default().policy(CachePolicy::CacheOnly))
      .await
      .unwrap();
    assert!(state.partial);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cache_and_network_updates_in_background() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::default();
    let transport = counting_transport(calls.clone());
    let store = DocumentStore::new(
      user_artifact(),
      cache.clone(),
      transport,
      vars(json!({ "id": "1" })),
    );
    store.send(SendParams::default()).await.unwrap();

    let mut updates = store.subscribe();
    let state = store
      .send(SendParams::default().policy(CachePolicy::CacheAndNetwork))
      .await
      .unwrap();
    assert_eq!(state.source, Some(DataSource::Cache));
    assert!(state.fetching);

    tokio::time::timeout(Duration::from_secs(1), async {
      loop {
        {
          let state = updates.borrow_and_update();
          if state.phase == FetchPhase::Settled && state.source == Some(DataSource::Network) {
            break;
          }
        }
        updates.changed().await.unwrap();
      }
    })
    .await
    .unwrap();
    let name = store.state().data.unwrap();
    assert_eq!(
      name.at_path(&["user", "name"]).and_then(ResponseValue::as_str),
      Some("call 2")
    );
  }

  #[tokio::test]
  async fn test_transport_failure_keeps_data() {
    let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = fail.clone();
    let transport: Arc<dyn Transport> = Arc::new(move |_: TransportRequest| {
      let fail = flag.load(Ordering::SeqCst);
      async move {
        if fail {
          Err(eyre!("connection reset"))
        } else {
          Ok(TransportResponse::data(json!({ "user": { "id": "1", "name": "a" } })))
        }
      }
    });
    let store = DocumentStore::new(
      user_artifact(),
      Cache::default(),
      transport,
      vars(json!({ "id": "1" })),
    );
    store.send(SendParams::default()).await.unwrap();

    fail.store(true, Ordering::SeqCst);
    let err = store
      .send(SendParams::default().policy(CachePolicy::NetworkOnly))
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Transport(_)));

    let state = store.state();
    assert_eq!(state.phase, FetchPhase::Errored);
    assert_eq!(state.errors.len(), 1);
    assert!(state.data.is_some());
  }

  #[tokio::test]
  async fn test_failed_fetch_picks_up_cache_writes_made_meanwhile() {
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Notify::new());
    let (counter, release) = (calls.clone(), gate.clone());
    let transport: Arc<dyn Transport> = Arc::new(move |_: TransportRequest| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      let release = release.clone();
      async move {
        if n == 0 {
          return Ok(TransportResponse::data(json!({ "user": { "id": "1", "name": "old" } })));
        }
        release.notified().await;
        Err(eyre!("connection reset"))
      }
    });
    let cache = Cache::default();
    let artifact = user_artifact();
    let v = vars(json!({ "id": "1" }));
    let store = DocumentStore::new(artifact.clone(), cache.clone(), transport, v.clone());
    store.send(SendParams::default()).await.unwrap();

    let mut updates = store.subscribe();
    let refetch = tokio::spawn({
      let store = store.clone();
      async move {
        store
          .send(SendParams::default().policy(CachePolicy::NetworkOnly))
          .await
      }
    });
    tokio::time::timeout(Duration::from_secs(1), async {
      while !updates.borrow_and_update().fetching {
        updates.changed().await.unwrap();
      }
    })
    .await
    .unwrap();

    // lands while the refetch is in flight, so the store holds it back
    let data = json!({ "user": { "id": "1", "name": "new" } });
    cache
      .write(WriteRequest::new(&artifact, &data).variables(&v))
      .unwrap();
    assert_eq!(
      store.state().data.unwrap().at_path(&["user", "name"]).and_then(ResponseValue::as_str),
      Some("old")
    );

    gate.notify_one();
    let err = refetch.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::Transport(_)));

    let state = store.state();
    assert_eq!(state.phase, FetchPhase::Errored);
    assert_eq!(state.data.unwrap().to_json(), data);
  }

  #[tokio::test]
  async fn test_graphql_errors_without_data() {
    let transport: Arc<dyn Transport> = Arc::new(|_: TransportRequest| async {
      Ok::<_, color_eyre::Report>(TransportResponse::errors(vec![GraphQLError::new("denied")]))
    });
    let store = DocumentStore::new(
      user_artifact(),
      Cache::default(),
      transport,
      vars(json!({ "id": "1" })),
    );
    let state = store.send(SendParams::default()).await.unwrap();
    assert_eq!(state.phase, FetchPhase::Errored);
    assert_eq!(state.errors[0].message, "denied");
  }

  #[tokio::test]
  async fn test_superseded_response_is_dropped() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let transport: Arc<dyn Transport> = Arc::new(move |req: TransportRequest| {
      counter.fetch_add(1, Ordering::SeqCst);
      async move {
        let id = req.variables.get("id").cloned().unwrap_or(Value::Null);
        // the first request is slower than the second
        let delay = if id == json!("1") { 50 } else { 5 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok::<_, color_eyre::Report>(TransportResponse::data(json!({
          "user": { "id": id, "name": "n" }
        })))
      }
    });
    let store = DocumentStore::new(user_artifact(), Cache::default(), transport, Map::new());

    let slow = store.send(SendParams::default().variables(vars(json!({ "id": "1" }))));
    let fast = store.send(SendParams::default().variables(vars(json!({ "id": "2" }))));
    let (slow, fast) = tokio::join!(slow, fast);
    slow.unwrap();
    fast.unwrap();

    let state = store.state();
    assert_eq!(state.variables, vars(json!({ "id": "2" })));
    assert_eq!(
      state.data.unwrap().at_path(&["user", "id"]).and_then(ResponseValue::as_str),
      Some("2")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // the superseded payload was never written
    assert!(!store.cache().exists(&RecordKey::new("User:1")));
  }

  #[tokio::test]
  async fn test_cache_notification_updates_idle_store() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::default();
    let artifact = user_artifact();
    let v = vars(json!({ "id": "1" }));
    let store = DocumentStore::new(
      artifact.clone(),
      cache.clone(),
      counting_transport(calls),
      v.clone(),
    );
    store.send(SendParams::default()).await.unwrap();

    let data = json!({ "user": { "id": "1", "name": "renamed" } });
    cache
      .write(WriteRequest::new(&artifact, &data).variables(&v))
      .unwrap();

    let state = store.state();
    assert_eq!(state.phase, FetchPhase::Settled);
    assert_eq!(state.data.unwrap().to_json(), data);
  }

  #[tokio::test]
  async fn test_optimistic_mutation_resolves_layer() {
    let cache = Cache::default();
    let query = user_artifact();
    let v = vars(json!({ "id": "1" }));
    cache
      .write(
        WriteRequest::new(&query, &json!({ "user": { "id": "1", "name": "old" } })).variables(&v),
      )
      .unwrap();

    let mutation: Arc<Artifact> = Arc::new(
      serde_json::from_value(json!({
        "name": "Rename",
        "kind": "mutation",
        "rootType": "Mutation",
        "selection": { "fields": [{
          "field": "rename",
          "type": "User",
          "selection": { "fields": [
            { "field": "id", "type": "ID" },
            { "field": "name", "type": "String" }
          ] }
        }] }
      }))
      .unwrap(),
    );
    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let gate = Arc::new(Mutex::new(Some(gate)));
    let transport: Arc<dyn Transport> = Arc::new(move |_: TransportRequest| {
      let gate = gate.lock().take();
      async move {
        if let Some(gate) = gate {
          let _ = gate.await;
        }
        Ok::<_, color_eyre::Report>(TransportResponse::data(json!({
          "rename": { "id": "1", "name": "server" }
        })))
      }
    });
    let store = DocumentStore::new(mutation, cache.clone(), transport, Map::new());

    let pending = tokio::spawn({
      let store = store.clone();
      async move {
        store
          .send(SendParams::default().optimistic(json!({ "rename": { "id": "1", "name": "guess" } })))
          .await
      }
    });

    let name = |cache: &Cache| {
      cache
        .read(&query, &v)
        .data
        .at_path(&["user", "name"])
        .and_then(ResponseValue::as_str)
        .map(str::to_string)
    };
    tokio::time::timeout(Duration::from_secs(1), async {
      while name(&cache).as_deref() != Some("guess") {
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
    })
    .await
    .unwrap();

    release.send(()).unwrap();
    let state = pending.await.unwrap().unwrap();
    assert_eq!(state.source, Some(DataSource::Network));
    assert_eq!(name(&cache).as_deref(), Some("server"));
  }
}
