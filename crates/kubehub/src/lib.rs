//! Kato kubehub: discovery, kind resolution and the dynamic resource client.
//!
//! Nothing in here knows about specific kinds. Callers hand in generic
//! documents and `"<kind>"` strings; the [`mapper::RestMapper`] turns kinds
//! into REST routes using the cluster's discovery documents, which are fronted
//! by the on-disk [`cache::CachedTransport`].

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod dynamic;
pub mod mapper;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use kato_apply::PatchStrategy;
use kato_core::ResourceIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use cache::{CachedTransport, DiscoveryTransport, RawResponse};
pub use config::ClusterConfig;
pub use dynamic::{DynamicClient, KubeConnector};
pub use mapper::{Mapping, RestMapper, Snapshot};
pub use memory::{MemoryClient, MemoryConnector};

/// Budget for list calls.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for single-object reads.
pub const GET_TIMEOUT: Duration = Duration::from_secs(10);
/// Connection-level budget for everything else.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Namespace used for namespaced kinds when neither the document nor the caller names one.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{resource} \"{name}\" not found")]
    NotFound { resource: String, name: String },
    #[error("{0}")]
    Discovery(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    InvalidManifest(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Data(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound { .. } => true,
            ClientError::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    /// `None` lists across all namespaces (or the whole cluster for cluster-scoped kinds).
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListOptions {
    pub fn in_namespace(ns: &str) -> Self { Self { namespace: Some(ns.to_string()), ..Default::default() } }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    Foreground,
    Background,
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub propagation: Option<Propagation>,
    pub grace_period_seconds: Option<u32>,
}

/// A served resource kind as seen through discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resource: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl From<&Mapping> for DiscoveredResource {
    fn from(m: &Mapping) -> Self {
        Self { group: m.group.clone(), version: m.version.clone(), kind: m.kind.clone(), resource: m.plural.clone(), namespaced: m.namespaced }
    }
}

/// Generic CRUD against any kind the cluster serves.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Resolve a kind, resource or short name to its REST mapping.
    async fn resolve(&self, kind: &str) -> ClientResult<Mapping>;

    /// Every kind currently served, in resolution-priority order.
    async fn discovered(&self) -> ClientResult<Vec<DiscoveredResource>>;

    async fn get(&self, kind: &str, name: &str, namespace: &str) -> ClientResult<Json>;

    async fn list(&self, kind: &str, opts: &ListOptions) -> ClientResult<Vec<Json>>;

    /// Idempotent create-or-three-way-merge of `doc`. `namespace_override`
    /// wins over the document's namespace for namespaced kinds only.
    async fn apply(&self, doc: &Json, namespace_override: Option<&str>) -> ClientResult<ResourceIdentity>;

    async fn patch(&self, kind: &str, name: &str, namespace: &str, patch: &[u8], strategy: PatchStrategy) -> ClientResult<ResourceIdentity>;

    async fn delete(&self, kind: &str, name: &str, namespace: &str, opts: &DeleteOptions) -> ClientResult<ResourceIdentity>;
}

/// Builds a client for one cluster from a freshly resolved connection config.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cfg: &ClusterConfig) -> ClientResult<Arc<dyn ResourceClient>>;
}

/// Namespace an object of `mapping` ends up in. Cluster-scoped kinds get `""`
/// and ignore the override.
pub fn effective_namespace(mapping: &Mapping, doc_namespace: &str, namespace_override: Option<&str>) -> String {
    if !mapping.namespaced {
        return String::new();
    }
    match namespace_override {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ if !doc_namespace.is_empty() => doc_namespace.to_string(),
        _ => DEFAULT_NAMESPACE.to_string(),
    }
}
