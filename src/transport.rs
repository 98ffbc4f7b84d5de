//! The seam to the network layer.
//!
//! The engine never speaks HTTP itself: document stores hand a
//! [`TransportRequest`] to a [`Transport`] and get back data plus GraphQL
//! errors, or a rejection when the request never produced a response.

use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::Artifact;

#[derive(Debug, Clone)]
pub struct TransportRequest {
  pub artifact: Arc<Artifact>,
  pub variables: Map<String, Value>,
  /// Caller-supplied data passed through untouched
  pub metadata: Option<Value>,
}

/// A GraphQL error as reported in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
  pub message: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub path: Vec<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub extensions: Option<Value>,
}

impl GraphQLError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      path: Vec::new(),
      extensions: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub errors: Vec<GraphQLError>,
}

impl TransportResponse {
  pub fn data(data: Value) -> Self {
    Self {
      data: Some(data),
      errors: Vec::new(),
    }
  }

  pub fn errors(errors: Vec<GraphQLError>) -> Self {
    Self { data: None, errors }
  }
}

/// Executes documents. A rejected future means no response was obtained.
pub trait Transport: Send + Sync {
  fn execute(&self, request: TransportRequest) -> BoxFuture<'static, Result<TransportResponse>>;
}

impl<F, Fut> Transport for F
where
  F: Fn(TransportRequest) -> Fut + Send + Sync,
  Fut: Future<Output = Result<TransportResponse>> + Send + 'static,
{
  fn execute(&self, request: TransportRequest) -> BoxFuture<'static, Result<TransportResponse>> {
    self(request).boxed()
  }
}
