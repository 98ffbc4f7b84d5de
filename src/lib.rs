//! Client-side GraphQL data layer.
//!
//! - [`cache`]: the normalized record store with optimistic layers, named
//!   lists, subscriptions, garbage collection and snapshots
//! - [`document`]: per-document observers driving fetches through a
//!   [`Transport`] under a cache policy
//! - [`pagination`]: cursor and offset page loading on top of documents

pub mod artifact;
pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod logging;
pub mod pagination;
pub mod transport;
pub mod value;

pub use artifact::{Artifact, ArtifactKind, CachePolicy, UpdateMode};
pub use cache::{Cache, ListHandle, ReadResult, RecordKey, WriteRequest};
pub use config::Config;
pub use document::{DocumentRegistry, DocumentState, DocumentStore, FetchPhase, SendParams};
pub use error::{CacheError, PageDirection, Result};
pub use pagination::{CursorPaginator, OffsetPaginator, PageInfo};
pub use transport::{GraphQLError, Transport, TransportRequest, TransportResponse};
pub use value::ResponseValue;
