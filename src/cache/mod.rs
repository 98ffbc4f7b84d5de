//! Normalized GraphQL cache.
//!
//! [`Cache`] is the single mutation authority over the record store, the
//! layer stack and the list registry. Every mutating call:
//! - validates and normalizes its input before touching shared state,
//! - applies its writes under one lock and collects one [`ChangeSet`],
//! - delivers one re-read per affected subscriber, in batch order.
//!
//! Delivery happens with the state lock released, so callbacks may read
//! from or write to the cache. The publish lock is held for the whole batch
//! so that deliveries from concurrent writers never interleave.

mod denormalize;
mod field_key;
mod gc;
mod layers;
mod lists;
mod normalize;
mod record;
mod storage;
mod store;
mod subscriptions;

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::artifact::{Artifact, ListAction, ListPosition, ListWhen, UpdateMode};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::value::ResponseValue;

use denormalize::Denormalizer;
use gc::GcSchedule;
use lists::{check_member_type, plan_change, plan_replace, ListRegistry, MemberChange};
use normalize::{Normalized, Normalizer, PendingListOp};
use store::{RecordStore, WriteTarget};

pub use field_key::{field_key, full_field_key, PAGINATION_ARGS};
pub use layers::LayerId;
pub use lists::{ListInstance, ListSelector};
pub use record::{escape_id, FieldKey, FieldRef, FieldValue, Link, RecordKey};
pub use storage::{
  CacheSnapshot, NoopStorage, SnapshotRecord, SnapshotStorage, SqliteStorage, StoredSnapshot,
};
pub use store::merge_links;
pub use subscriptions::{ChangeSet, SubscriberId};

/// Callback invoked with the fresh read after a batch changed it.
pub type WatchCallback = Arc<dyn Fn(&ReadResult) + Send + Sync>;

/// A denormalized read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadResult {
  pub data: ResponseValue,
  /// Some selected field is not in the cache
  pub partial: bool,
  /// Some field read is stale
  pub stale: bool,
}

/// Input of [`Cache::write`].
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
  artifact: &'a Artifact,
  data: &'a Value,
  variables: Cow<'a, Map<String, Value>>,
  parent: Option<RecordKey>,
  apply_updates: Vec<UpdateMode>,
  layer: Option<LayerId>,
}

impl<'a> WriteRequest<'a> {
  pub fn new(artifact: &'a Artifact, data: &'a Value) -> Self {
    Self {
      artifact,
      data,
      variables: Cow::Owned(Map::new()),
      parent: None,
      apply_updates: Vec::new(),
      layer: None,
    }
  }

  pub fn variables(mut self, variables: &'a Map<String, Value>) -> Self {
    self.variables = Cow::Borrowed(variables);
    self
  }

  /// Record the top-level fields belong to; the root record by default.
  /// Fragment writes name the record the fragment was spread on.
  pub fn parent(mut self, parent: RecordKey) -> Self {
    self.parent = Some(parent);
    self
  }

  /// Merge paged lists at the given ends instead of replacing them.
  pub fn apply_updates(mut self, modes: impl IntoIterator<Item = UpdateMode>) -> Self {
    self.apply_updates = modes.into_iter().collect();
    self
  }

  /// Write into a layer instead of the base store.
  pub fn layer(mut self, layer: LayerId) -> Self {
    self.layer = Some(layer);
    self
  }
}

/// What a subscriber reads.
struct ReadQuery {
  artifact: Arc<Artifact>,
  variables: Map<String, Value>,
  parent: RecordKey,
}

struct Watcher {
  query: ReadQuery,
  callback: WatchCallback,
  last: ReadResult,
}

/// A normalized payload whose list operations already passed validation.
struct Prepared {
  normalized: Normalized,
  operations: Vec<(PendingListOp, Vec<ListInstance>)>,
}

struct CacheState {
  store: RecordStore,
  lists: ListRegistry,
  gc: GcSchedule,
  watchers: HashMap<SubscriberId, Watcher>,
  next_subscriber: u64,
}

impl CacheState {
  fn read(&self, query: &ReadQuery) -> (ReadResult, BTreeSet<FieldRef>) {
    let out = Denormalizer::new(&self.store, &query.variables)
      .run(&query.artifact.selection, &query.parent);
    let result = ReadResult {
      data: out.data,
      partial: out.partial,
      stale: out.stale,
    };
    (result, out.fields)
  }

  /// Normalize a request and check its list operations. Nothing is mutated.
  fn prepare(&self, config: &CacheConfig, request: &WriteRequest<'_>) -> Result<Prepared> {
    let parent = request.parent.clone().unwrap_or_else(RecordKey::root);
    let parent_type = if parent.is_root() {
      None
    } else {
      Some(
        self
          .store
          .record_type(&parent)
          .unwrap_or(&request.artifact.root_type)
          .to_string(),
      )
    };
    let normalized = Normalizer::new(
      &self.store,
      &request.variables,
      &request.apply_updates,
      config,
    )
    .run(
      &request.artifact.selection,
      &parent,
      parent_type.as_deref(),
      request.data,
    )?;

    let mut operations = Vec::with_capacity(normalized.operations.len());
    for op in &normalized.operations {
      let instances = match (&op.action, &op.list) {
        (ListAction::Delete, _) | (_, None) => Vec::new(),
        (_, Some(name)) => {
          let selector = ListSelector {
            name: name.clone(),
            parent: op.parent.clone(),
            when: op.when.clone(),
          };
          let instances = self.lists.select(&selector);
          for instance in &instances {
            check_member_type(
              instance,
              &op.member,
              op.member_type.as_deref(),
              &config.possible_types,
            )?;
          }
          instances
        }
      };
      operations.push((op.clone(), instances));
    }

    Ok(Prepared {
      normalized,
      operations,
    })
  }

  /// Register lists and apply list operations of an already-written batch.
  fn finish(
    &mut self,
    lists: Vec<ListInstance>,
    operations: Vec<(PendingListOp, Vec<ListInstance>)>,
    target: WriteTarget,
  ) -> Result<ChangeSet> {
    for instance in lists {
      self.lists.register(instance);
    }
    let mut changes = ChangeSet::default();
    for (op, instances) in operations {
      let change = match op.action {
        ListAction::Delete => {
          changes.extend(self.delete(&op.member, target)?);
          continue;
        }
        ListAction::Insert => MemberChange::Insert(op.position),
        ListAction::Remove => MemberChange::Remove,
        ListAction::Toggle => MemberChange::Toggle(op.position, None),
      };
      for instance in &instances {
        changes.extend(self.change_member(instance, &op.member, change, target)?);
      }
    }
    Ok(changes)
  }

  fn change_member(
    &mut self,
    instance: &ListInstance,
    member: &RecordKey,
    change: MemberChange,
    target: WriteTarget,
  ) -> Result<ChangeSet> {
    let writes = plan_change(&self.store, instance, member, change);
    if writes.is_empty() {
      return Ok(ChangeSet::default());
    }
    self.store.write(writes, target)
  }

  fn delete(&mut self, key: &RecordKey, target: WriteTarget) -> Result<ChangeSet> {
    let changes = self.store.delete(key, target)?;
    if target == WriteTarget::Base {
      self.lists.forget(&changes.deleted);
    }
    Ok(changes)
  }

  /// Re-read one subscriber. Returns the result to deliver when it differs
  /// from the last delivered one.
  fn refresh(&mut self, id: SubscriberId) -> Option<(ReadResult, WatchCallback)> {
    let (result, fields) = self.read(&self.watchers.get(&id)?.query);
    self.store.subscriptions.replace(id, fields);
    let watcher = self.watchers.get_mut(&id)?;
    if watcher.last == result {
      return None;
    }
    watcher.last = result.clone();
    Some((result, watcher.callback.clone()))
  }
}

struct CacheInner {
  config: CacheConfig,
  state: Mutex<CacheState>,
  publish: ReentrantMutex<()>,
}

/// Shared handle to one cache; clones refer to the same data.
#[derive(Clone)]
pub struct Cache {
  inner: Arc<CacheInner>,
}

impl Default for Cache {
  fn default() -> Self {
    Self::new(CacheConfig::default())
  }
}

impl std::fmt::Debug for Cache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("Cache")
      .field("records", &state.store.len())
      .field("layers", &state.store.layers.len())
      .field("lists", &state.lists.len())
      .field("subscribers", &state.watchers.len())
      .finish()
  }
}

impl Cache {
  pub fn new(config: CacheConfig) -> Self {
    let state = CacheState {
      store: RecordStore::new(config.stale_after()),
      lists: ListRegistry::default(),
      gc: GcSchedule::new(config.gc_buffer_size),
      watchers: HashMap::new(),
      next_subscriber: 0,
    };
    Self {
      inner: Arc::new(CacheInner {
        config,
        state: Mutex::new(state),
        publish: ReentrantMutex::new(()),
      }),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  /// Normalize and write a payload, then notify affected subscribers.
  ///
  /// Fails without changing anything when the payload cannot be normalized
  /// or one of its list operations targets a list of another type.
  pub fn write(&self, request: WriteRequest<'_>) -> Result<ChangeSet> {
    let target = WriteTarget::from(request.layer);
    self.publish(|state| {
      if let WriteTarget::Layer(id) = target {
        state.store.layers.get(id)?;
      }
      let Prepared {
        normalized,
        operations,
      } = state.prepare(&self.inner.config, &request)?;
      let mut changes = state.store.write(normalized.writes, target)?;
      changes.extend(state.finish(normalized.lists, operations, target)?);
      debug!(
        document = %request.artifact.name,
        changed = changes.fields.len(),
        deleted = changes.deleted.len(),
        "wrote payload"
      );
      Ok(changes)
    })
  }

  /// Denormalize a document from the root record.
  pub fn read(&self, artifact: &Artifact, variables: &Map<String, Value>) -> ReadResult {
    self.read_at(artifact, variables, &RecordKey::root())
  }

  /// Denormalize a document starting at `parent` (fragments).
  pub fn read_at(
    &self,
    artifact: &Artifact,
    variables: &Map<String, Value>,
    parent: &RecordKey,
  ) -> ReadResult {
    let state = self.inner.state.lock();
    let out = Denormalizer::new(&state.store, variables).run(&artifact.selection, parent);
    ReadResult {
      data: out.data,
      partial: out.partial,
      stale: out.stale,
    }
  }

  /// Watch a document read from the root record. The callback runs once per
  /// write batch that changes the result; the set of watched fields follows
  /// every re-read.
  pub fn subscribe<F>(
    &self,
    artifact: Arc<Artifact>,
    variables: Map<String, Value>,
    callback: F,
  ) -> SubscriberId
  where
    F: Fn(&ReadResult) + Send + Sync + 'static,
  {
    self.subscribe_at(artifact, variables, RecordKey::root(), callback)
  }

  pub fn subscribe_at<F>(
    &self,
    artifact: Arc<Artifact>,
    variables: Map<String, Value>,
    parent: RecordKey,
    callback: F,
  ) -> SubscriberId
  where
    F: Fn(&ReadResult) + Send + Sync + 'static,
  {
    let mut state = self.inner.state.lock();
    state.next_subscriber += 1;
    let id = SubscriberId(state.next_subscriber);
    let query = ReadQuery {
      artifact,
      variables,
      parent,
    };
    let (last, fields) = state.read(&query);
    state.store.subscriptions.replace(id, fields);
    state.watchers.insert(
      id,
      Watcher {
        query,
        callback: Arc::new(callback),
        last,
      },
    );
    id
  }

  /// Returns false when the subscriber was already gone.
  pub fn unsubscribe(&self, id: SubscriberId) -> bool {
    let mut state = self.inner.state.lock();
    state.store.subscriptions.remove(id);
    state.watchers.remove(&id).is_some()
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.state.lock().watchers.len()
  }

  pub fn create_layer(&self, optimistic: bool) -> LayerId {
    let id = self.inner.state.lock().store.create_layer(optimistic);
    debug!(layer = %id, optimistic, "created layer");
    id
  }

  /// Fold a layer into the base store. With a replacement payload the
  /// layer's own writes are dropped in favor of the payload.
  pub fn resolve_layer(
    &self,
    id: LayerId,
    replacement: Option<WriteRequest<'_>>,
  ) -> Result<ChangeSet> {
    self.publish(|state| match replacement {
      None => state.store.resolve_layer(id, None),
      Some(request) => {
        state.store.layers.get(id)?;
        let Prepared {
          normalized,
          operations,
        } = state.prepare(&self.inner.config, &request)?;
        let mut changes = state.store.resolve_layer(id, Some(normalized.writes))?;
        changes.extend(state.finish(normalized.lists, operations, WriteTarget::Base)?);
        Ok(changes)
      }
    })
  }

  /// Drop a layer; every field it shadowed falls back to the layers below.
  pub fn discard_layer(&self, id: LayerId) -> Result<ChangeSet> {
    self.publish(|state| state.store.discard_layer(id))
  }

  /// Remove a record, from the base store or only within a layer.
  pub fn delete(&self, key: &RecordKey, layer: Option<LayerId>) -> Result<ChangeSet> {
    self.publish(|state| state.delete(key, WriteTarget::from(layer)))
  }

  /// Effective value of one field.
  pub fn get_field(&self, key: &RecordKey, field: &str) -> Option<FieldValue> {
    self.inner.state.lock().store.read(key, field).cloned()
  }

  pub fn exists(&self, key: &RecordKey) -> bool {
    self.inner.state.lock().store.exists(key)
  }

  /// Handle for imperative operations on a named list.
  pub fn list(&self, name: impl Into<String>) -> ListHandle {
    ListHandle {
      cache: self.clone(),
      selector: ListSelector::new(name),
      layer: None,
    }
  }

  /// Register a list instance and set its members.
  pub fn register_list(&self, instance: ListInstance, members: &[RecordKey]) -> Result<ChangeSet> {
    self.publish(|state| {
      for member in members {
        check_member_type(
          &instance,
          member,
          state.store.record_type(member),
          &self.inner.config.possible_types,
        )?;
      }
      let writes = plan_replace(&state.store, &instance, members);
      let changes = state.store.write(writes, WriteTarget::Base)?;
      state.lists.register(instance);
      Ok(changes)
    })
  }

  fn change_members(
    &self,
    selector: &ListSelector,
    layer: Option<LayerId>,
    member: &RecordKey,
    change: MemberChange,
  ) -> Result<ChangeSet> {
    self.publish(|state| {
      if !state.lists.contains(&selector.name) {
        return Err(CacheError::UnknownList(selector.name.clone()));
      }
      let target = WriteTarget::from(layer);
      if let WriteTarget::Layer(id) = target {
        state.store.layers.get(id)?;
      }
      let instances = state.lists.select(selector);
      let member_type = state.store.record_type(member).map(str::to_string);
      for instance in &instances {
        check_member_type(
          instance,
          member,
          member_type.as_deref(),
          &self.inner.config.possible_types,
        )?;
      }
      let mut changes = ChangeSet::default();
      for instance in &instances {
        changes.extend(state.change_member(instance, member, change, target)?);
      }
      Ok(changes)
    })
  }

  /// Mark base-store fields stale, by type and field name. Subscribers see
  /// `stale` flip on their next read.
  pub fn mark_stale(&self, type_name: Option<&str>, field: Option<&str>) -> usize {
    let _publish = self.inner.publish.lock();
    let (marked, ids) = {
      let mut state = self.inner.state.lock();
      let marked = state.store.mark_stale(type_name, field);
      (marked, state.watchers.keys().copied().collect())
    };
    self.deliver(ids);
    marked
  }

  pub fn mark_record_stale(&self, key: &RecordKey, field: Option<&str>) -> usize {
    let _publish = self.inner.publish.lock();
    let (marked, ids) = {
      let mut state = self.inner.state.lock();
      let marked = state.store.mark_record_stale(key, field);
      (marked, state.watchers.keys().copied().collect())
    };
    self.deliver(ids);
    marked
  }

  /// Run one garbage collection sweep. Returns the evicted keys.
  pub fn collect_garbage(&self) -> BTreeSet<RecordKey> {
    let mut state = self.inner.state.lock();
    let state = &mut *state;
    let evicted = state.gc.tick(&mut state.store);
    state.lists.forget(&evicted);
    evicted
  }

  /// Sweep on a fixed period until every handle to the cache is dropped.
  pub fn spawn_gc(&self, period: Duration) -> JoinHandle<()> {
    let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        Cache { inner }.collect_garbage();
      }
    })
  }

  /// Copy of every base-store record.
  pub fn serialize(&self) -> CacheSnapshot {
    let state = self.inner.state.lock();
    let mut records: Vec<SnapshotRecord> = state
      .store
      .base()
      .iter()
      .map(|(key, record)| SnapshotRecord {
        key: key.clone(),
        type_name: record.type_name.clone(),
        fields: record
          .fields
          .iter()
          .map(|(field, entry)| (field.clone(), entry.clone()))
          .collect(),
      })
      .collect();
    records.sort_by(|a, b| a.key.cmp(&b.key));
    CacheSnapshot { records }
  }

  /// Merge a snapshot into the base store and notify subscribers.
  pub fn hydrate(&self, snapshot: CacheSnapshot) -> ChangeSet {
    let count = snapshot.records.len();
    let result = self.publish(|state| {
      let mut changes = ChangeSet::default();
      for record in snapshot.records {
        let mut restored = record::Record::new(record.type_name, 0);
        restored.fields = record.fields.into_iter().collect();
        changes
          .fields
          .extend(state.store.restore_record(record.key, restored));
      }
      Ok(changes)
    });
    info!(records = count, "hydrated cache");
    result.unwrap_or_default()
  }

  pub fn persist(&self, storage: &dyn SnapshotStorage) -> color_eyre::Result<()> {
    let snapshot = self.serialize();
    storage.save(&snapshot)?;
    info!(records = snapshot.records.len(), "persisted cache snapshot");
    Ok(())
  }

  /// Hydrate from storage. Returns false when there was nothing stored.
  pub fn restore(&self, storage: &dyn SnapshotStorage) -> color_eyre::Result<bool> {
    match storage.load()? {
      Some(stored) => {
        debug!(saved_at = %stored.saved_at, "restoring cache snapshot");
        self.hydrate(stored.snapshot);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Drop every record, layer and list. Subscribers stay registered and are
  /// notified that their data is gone.
  pub fn reset(&self) -> ChangeSet {
    let result = self.publish(|state| {
      state.lists.clear();
      state.gc.clear();
      Ok(state.store.clear())
    });
    info!("cache reset");
    result.unwrap_or_default()
  }

  pub fn len(&self) -> usize {
    self.inner.state.lock().store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Run `mutate` as one batch and deliver its change set.
  fn publish<F>(&self, mutate: F) -> Result<ChangeSet>
  where
    F: FnOnce(&mut CacheState) -> Result<ChangeSet>,
  {
    let _publish = self.inner.publish.lock();
    let (changes, affected) = {
      let mut state = self.inner.state.lock();
      let changes = mutate(&mut state)?;
      let affected = state.store.subscriptions.affected(&changes);
      (changes, affected)
    };
    self.deliver(affected);
    Ok(changes)
  }

  fn deliver(&self, ids: BTreeSet<SubscriberId>) {
    for id in ids {
      let refreshed = self.inner.state.lock().refresh(id);
      if let Some((result, callback)) = refreshed {
        callback(&result);
      }
    }
  }
}

/// Imperative access to the instances of one named list.
#[derive(Clone)]
pub struct ListHandle {
  cache: Cache,
  selector: ListSelector,
  layer: Option<LayerId>,
}

impl ListHandle {
  /// Only instances under this parent (record key or id).
  pub fn parent(mut self, parent: impl Into<String>) -> Self {
    self.selector = self.selector.parent(parent);
    self
  }

  /// Only instances fetched with matching arguments.
  pub fn when(mut self, when: ListWhen) -> Self {
    self.selector = self.selector.when(when);
    self
  }

  /// Apply changes inside a layer.
  pub fn layer(mut self, layer: LayerId) -> Self {
    self.layer = Some(layer);
    self
  }

  pub fn instances(&self) -> Vec<ListInstance> {
    self.cache.inner.state.lock().lists.select(&self.selector)
  }

  pub fn insert(&self, member: &RecordKey, position: ListPosition) -> Result<ChangeSet> {
    self.apply(member, MemberChange::Insert(position))
  }

  pub fn remove(&self, member: &RecordKey) -> Result<ChangeSet> {
    self.apply(member, MemberChange::Remove)
  }

  /// Flip membership, or force it with `present`.
  pub fn toggle(
    &self,
    member: &RecordKey,
    position: ListPosition,
    present: Option<bool>,
  ) -> Result<ChangeSet> {
    self.apply(member, MemberChange::Toggle(position, present))
  }

  fn apply(&self, member: &RecordKey, change: MemberChange) -> Result<ChangeSet> {
    self
      .cache
      .change_members(&self.selector, self.layer, member, change)
  }
}
