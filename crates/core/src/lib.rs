//! Kato core types: the data model shared by the cluster client, the action
//! subsystem and the stores, plus the collaborator traits they meet at.

#![forbid(unsafe_code)]

pub mod doc;
pub mod keys;
pub mod names;
pub mod tokens;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use names::ManifestName;

/// Generic resource document: one cluster object as untyped nested maps.
pub type Document = serde_json::Value;

/// Connection descriptor for one cluster account, owned by the credential store.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub name: String,
    pub host: String,
    /// Base64-encoded PEM bundle of the cluster CA.
    #[serde(default)]
    pub ca_data: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Reference handed to the token issuer when no bearer token is stored.
    #[serde(default)]
    pub token_provider: Option<String>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("ca_data_len", &self.ca_data.len())
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("token_provider", &self.token_provider)
            .finish()
    }
}

/// Identity of a cluster object as resolved through discovery.
/// `namespace` is empty for cluster-scoped kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    pub name: String,
    pub namespace: String,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub kind: String,
}

impl ResourceIdentity {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// What kind of operation produced a [`ResourceRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    Deploy,
    Delete,
    Scale,
    Patch,
    Rollback,
    RollingRestart,
    RunJob,
    Cleanup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Deploy => "deploy",
            TaskType::Delete => "delete",
            TaskType::Scale => "scale",
            TaskType::Patch => "patch",
            TaskType::Rollback => "rollback",
            TaskType::RollingRestart => "rollingRestart",
            TaskType::RunJob => "runJob",
            TaskType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "deploy" => TaskType::Deploy,
            "delete" => TaskType::Delete,
            "scale" => TaskType::Scale,
            "patch" => TaskType::Patch,
            "rollback" => TaskType::Rollback,
            "rollingRestart" => TaskType::RollingRestart,
            "runJob" => TaskType::RunJob,
            "cleanup" => TaskType::Cleanup,
            other => return Err(anyhow::anyhow!("unknown task type {}", other)),
        })
    }
}

/// Immutable record of one object touched by a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub task_id: String,
    pub task_type: TaskType,
    /// Seconds since epoch when the record was written.
    pub timestamp: i64,
    pub account_name: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub api_group: String,
    pub resource: String,
    pub version: String,
    pub spinnaker_app: String,
}

impl ResourceRecord {
    pub fn new(task_id: &str, task_type: TaskType, account: &str, app: &str, id: &ResourceIdentity) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_type,
            timestamp: now_ts(),
            account_name: account.to_string(),
            kind: id.kind.clone(),
            name: id.name.clone(),
            namespace: id.namespace.clone(),
            api_group: id.group.clone(),
            resource: id.resource.clone(),
            version: id.version.clone(),
            spinnaker_app: app.to_string(),
        }
    }

    /// Address of the recorded object in `"<kind> <name>"` form.
    pub fn manifest_name(&self) -> String { format!("{} {}", self.kind, self.name) }
}

/// Field filter for record lookups; `None` fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub account_name: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub spinnaker_app: Option<String>,
}

impl RecordFilter {
    pub fn matches(&self, r: &ResourceRecord) -> bool {
        fn ok(want: &Option<String>, have: &str) -> bool { want.as_deref().map_or(true, |w| w == have) }
        ok(&self.account_name, &r.account_name)
            && ok(&self.kind, &r.kind)
            && ok(&self.namespace, &r.namespace)
            && ok(&self.spinnaker_app, &r.spinnaker_app)
    }
}

/// Resolved artifact that manifests may reference by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub location: String,
}

/// Logical grouping of an application's resources across versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Moniker {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub cluster: Option<String>,
}

/// Credential/account collaborator.
#[async_trait::async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_provider(&self, name: &str) -> Result<Provider>;
    async fn list_accounts_by_application(&self, app: &str) -> Result<Vec<String>>;
}

/// Task/resource persistence collaborator.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn create_resource_record(&self, record: &ResourceRecord) -> Result<()>;
    async fn list_resources_by_task_id(&self, task_id: &str) -> Result<Vec<ResourceRecord>>;
    async fn list_resources_by_fields(&self, filter: &RecordFilter) -> Result<Vec<ResourceRecord>>;
}

/// Bearer-token issuing collaborator. `provider_ref` selects a provider-specific
/// token; `None` asks for the ambient default.
#[async_trait::async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn token(&self, provider_ref: Option<&str>) -> Result<String>;
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub mod prelude {
    pub use super::{
        AccountStore, Artifact, Document, ManifestName, Moniker, Provider, RecordFilter, ResourceIdentity,
        ResourceRecord, ResourceStore, TaskType, TokenIssuer,
    };
}
