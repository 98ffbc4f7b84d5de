//! Mark-and-sweep eviction of unreachable records.
//!
//! Roots are the root record, every record with an active subscriber and
//! every record a layer touches. A record that stays unreachable with an
//! unchanged generation for `buffer` sweeps is evicted; any write to it or
//! link to it in the meantime bumps its generation and restarts the count.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use super::record::RecordKey;
use super::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
  generation: u64,
  ticks: usize,
}

#[derive(Debug, Default)]
pub struct GcSchedule {
  buffer: usize,
  candidates: HashMap<RecordKey, Candidate>,
}

impl GcSchedule {
  pub fn new(buffer: usize) -> Self {
    Self {
      buffer,
      candidates: HashMap::new(),
    }
  }

  /// Run one sweep and return the evicted keys.
  pub fn tick(&mut self, store: &mut RecordStore) -> BTreeSet<RecordKey> {
    let live = reachable(store);
    let unreachable: Vec<(RecordKey, u64)> = store
      .base()
      .iter()
      .filter(|(key, _)| !live.contains(*key))
      .map(|(key, record)| (key.clone(), record.generation))
      .collect();

    let current: HashSet<&RecordKey> = unreachable.iter().map(|(k, _)| k).collect();
    self.candidates.retain(|key, _| current.contains(key));

    let mut evicted = BTreeSet::new();
    for (key, generation) in &unreachable {
      let candidate = self.candidates.entry(key.clone()).or_insert(Candidate {
        generation: *generation,
        ticks: 0,
      });
      if candidate.generation != *generation {
        *candidate = Candidate {
          generation: *generation,
          ticks: 0,
        };
      }
      if candidate.ticks >= self.buffer {
        evicted.insert(key.clone());
      } else {
        candidate.ticks += 1;
      }
    }

    for key in &evicted {
      self.candidates.remove(key);
      store.evict(key);
    }
    if !evicted.is_empty() {
      debug!(evicted = evicted.len(), "garbage collected records");
    }
    evicted
  }

  /// Sweeps `key` has been waiting for, if it is a candidate.
  pub fn ticks_of(&self, key: &RecordKey) -> Option<usize> {
    self.candidates.get(key).map(|c| c.ticks)
  }

  pub fn clear(&mut self) {
    self.candidates.clear();
  }
}

fn reachable(store: &RecordStore) -> HashSet<RecordKey> {
  let mut seen: HashSet<RecordKey> = HashSet::new();
  let mut queue: VecDeque<RecordKey> = VecDeque::new();
  queue.push_back(RecordKey::root());
  queue.extend(store.subscriptions.subscribed_records().cloned());
  queue.extend(store.layer_pinned());

  while let Some(key) = queue.pop_front() {
    if !seen.insert(key.clone()) {
      continue;
    }
    for next in store.links_from(&key) {
      if !seen.contains(&next) {
        queue.push_back(next);
      }
    }
  }
  seen
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::record::{FieldRef, FieldValue, FieldWrite, Link};
  use crate::cache::store::WriteTarget;
  use crate::cache::subscriptions::SubscriberId;
  use serde_json::json;

  fn scalar(key: &str) -> FieldWrite {
    FieldWrite {
      key: RecordKey::new(key),
      type_name: None,
      field: "name".to_string(),
      value: FieldValue::Scalar(json!("x")),
    }
  }

  #[test]
  fn test_orphan_is_evicted_after_buffer() {
    let mut store = RecordStore::new(None);
    store
      .write(vec![scalar("User:1")], WriteTarget::Base)
      .unwrap();
    let mut gc = GcSchedule::new(2);
    let key = RecordKey::new("User:1");

    assert!(gc.tick(&mut store).is_empty());
    assert!(gc.tick(&mut store).is_empty());
    assert_eq!(gc.ticks_of(&key), Some(2));
    assert!(gc.tick(&mut store).contains(&key));
    assert!(store.is_empty());
  }

  #[test]
  fn test_write_restarts_the_countdown() {
    let mut store = RecordStore::new(None);
    store
      .write(vec![scalar("User:1")], WriteTarget::Base)
      .unwrap();
    let mut gc = GcSchedule::new(1);
    let key = RecordKey::new("User:1");

    gc.tick(&mut store);
    store
      .write(vec![scalar("User:1")], WriteTarget::Base)
      .unwrap();
    assert!(gc.tick(&mut store).is_empty());
    assert!(gc.tick(&mut store).contains(&key));
  }

  #[test]
  fn test_records_reachable_from_roots_survive() {
    let mut store = RecordStore::new(None);
    store
      .write(
        vec![
          scalar("User:1"),
          scalar("User:2"),
          scalar("User:3"),
          FieldWrite {
            key: RecordKey::root(),
            type_name: None,
            field: "viewer".to_string(),
            value: FieldValue::Link(Link::Record(RecordKey::new("User:1"))),
          },
        ],
        WriteTarget::Base,
      )
      .unwrap();
    store.subscriptions.replace(
      SubscriberId(1),
      [FieldRef::new(RecordKey::new("User:2"), "name")]
        .into_iter()
        .collect(),
    );
    let mut gc = GcSchedule::new(0);

    let evicted = gc.tick(&mut store);
    assert_eq!(evicted.len(), 1);
    assert!(evicted.contains(&RecordKey::new("User:3")));
    assert!(store.exists(&RecordKey::new("User:1")));
    assert!(store.exists(&RecordKey::new("User:2")));
  }
}
