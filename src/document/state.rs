//! Observable state of one document.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::transport::GraphQLError;
use crate::value::ResponseValue;

/// Where a document is in its fetch lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPhase {
  /// Nothing has been sent yet
  #[default]
  Idle,
  Fetching,
  Settled,
  Errored,
}

/// Origin of the current `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
  Cache,
  Network,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentState {
  pub data: Option<ResponseValue>,
  pub errors: Vec<GraphQLError>,
  pub fetching: bool,
  pub partial: bool,
  pub stale: bool,
  pub variables: Map<String, Value>,
  pub phase: FetchPhase,
  pub source: Option<DataSource>,
}

impl DocumentState {
  pub fn new(variables: Map<String, Value>) -> Self {
    Self {
      variables,
      ..Default::default()
    }
  }

  pub fn is_fetching(&self) -> bool {
    self.phase == FetchPhase::Fetching
  }

  pub fn is_errored(&self) -> bool {
    self.phase == FetchPhase::Errored
  }

  pub fn start_fetch(&mut self, variables: Map<String, Value>) {
    self.variables = variables;
    self.fetching = true;
    self.phase = FetchPhase::Fetching;
  }

  /// Prior data is kept so consumers can keep showing it.
  pub fn fail(&mut self, errors: Vec<GraphQLError>) {
    self.errors = errors;
    self.fetching = false;
    self.phase = FetchPhase::Errored;
  }

  pub fn settle(&mut self, data: ResponseValue, source: DataSource) {
    self.data = Some(data);
    self.source = Some(source);
    self.errors.clear();
    self.fetching = false;
    self.phase = FetchPhase::Settled;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_failure_keeps_prior_data() {
    let mut state = DocumentState::default();
    state.start_fetch(Map::new());
    state.settle(ResponseValue::from_json(&json!({ "a": 1 })), DataSource::Network);
    assert_eq!(state.phase, FetchPhase::Settled);

    state.start_fetch(Map::new());
    assert!(state.is_fetching());
    state.fail(vec![GraphQLError::new("boom")]);

    assert!(state.is_errored());
    assert!(!state.fetching);
    assert_eq!(state.data.unwrap().to_json(), json!({ "a": 1 }));
  }
}
