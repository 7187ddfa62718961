//! Kato Ops: manifest operations against Spinnaker-managed clusters.
//!
//! A batch of [`Operation`]s shares one task id and runs strictly in order,
//! stopping at the first failure. Every action resolves its account, builds a
//! fresh connection and records what it touched so the task can be replayed
//! later by [`KatoOps::task_status`].

#![forbid(unsafe_code)]

pub mod actions;
pub mod request;
pub mod server_groups;
pub mod task;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use kato_core::{AccountStore, ResourceIdentity, ResourceRecord, ResourceStore, TaskType, TokenIssuer};
use kato_kubehub::{ClusterConfig, Connector, ResourceClient};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub use actions::Action;
pub use request::{parse_operations, Operation};
pub use server_groups::ServerGroup;
pub use task::{ManifestView, ResourceStatus, TaskStatus};

/// External collaborators every action needs. Cheap to clone.
#[derive(Clone)]
pub struct Collaborators {
    pub accounts: Arc<dyn AccountStore>,
    pub records: Arc<dyn ResourceStore>,
    pub tokens: Arc<dyn TokenIssuer>,
    pub connector: Arc<dyn Connector>,
}

impl Collaborators {
    /// Resolve `account` and connect to its cluster. Nothing is cached: the
    /// provider and token are looked up again on every call.
    pub async fn connect(&self, account: &str) -> Result<Arc<dyn ResourceClient>> {
        let provider = self.accounts.get_provider(account).await?;
        let token = match provider.bearer_token.as_deref().filter(|t| !t.is_empty()) {
            Some(t) => t.to_string(),
            None => self
                .tokens
                .token(provider.token_provider.as_deref())
                .await
                .with_context(|| format!("issuing token for account {}", account))?,
        };
        let cfg = ClusterConfig::from_provider(&provider, token)?;
        let client = self.connector.connect(&cfg).await?;
        Ok(client)
    }
}

/// State shared by the actions of one batch.
pub struct TaskContext<'a> {
    pub task_id: String,
    pub deps: &'a Collaborators,
}

impl<'a> TaskContext<'a> {
    pub fn new(task_id: impl Into<String>, deps: &'a Collaborators) -> Self { Self { task_id: task_id.into(), deps } }

    pub async fn connect(&self, account: &str) -> Result<Arc<dyn ResourceClient>> { self.deps.connect(account).await }

    /// Record one object touched by this task.
    pub async fn record(&self, task_type: TaskType, account: &str, app: &str, id: &ResourceIdentity) -> Result<()> {
        let rec = ResourceRecord::new(&self.task_id, task_type, account, app, id);
        self.deps.records.create_resource_record(&rec).await
    }
}

/// Handle returned for a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub id: String,
    pub resource_uri: String,
}

impl TaskRef {
    pub fn new(id: String) -> Self {
        let resource_uri = format!("/task/{}", id);
        Self { id, resource_uri }
    }
}

/// Manifest operations surface.
#[async_trait::async_trait]
pub trait KatoOps: Send + Sync {
    /// Run a batch in order under a new task id; the first failure aborts the rest.
    async fn run_operations(&self, ops: Vec<Operation>) -> Result<TaskRef>;

    /// Replay a task's records against the live clusters.
    async fn task_status(&self, task_id: &str) -> Result<TaskStatus>;

    /// Live document and rollout status of `"<kind> <name>"`.
    async fn get_manifest(&self, account: &str, location: &str, name: &str) -> Result<ManifestView>;

    /// Server groups of `app` across every account that holds its resources.
    async fn list_server_groups(&self, app: &str) -> Result<Vec<ServerGroup>>;
}

/// Default implementation over the collaborator traits.
pub struct Ops {
    deps: Collaborators,
}

impl Ops {
    pub fn new(deps: Collaborators) -> Self { Self { deps } }

    pub fn deps(&self) -> &Collaborators { &self.deps }

    /// Run `ops` under an explicit task id.
    pub async fn run_with_id(&self, task_id: &str, ops: Vec<Operation>) -> Result<()> {
        let ctx = TaskContext::new(task_id, &self.deps);
        for (i, op) in ops.iter().enumerate() {
            let name = op.name();
            let started = Instant::now();
            counter!("action_total", 1u64, "action" => name);
            info!(task_id, index = i, action = name, account = %op.account(), "running action");
            if let Err(e) = actions::dispatch(op, &ctx).await {
                counter!("action_errors_total", 1u64, "action" => name);
                error!(task_id, index = i, action = name, error = %e, "action failed; aborting batch");
                return Err(e);
            }
            histogram!("action_ms", started.elapsed().as_secs_f64() * 1000.0, "action" => name);
        }
        info!(task_id, actions = ops.len(), "batch complete");
        Ok(())
    }
}

#[async_trait::async_trait]
impl KatoOps for Ops {
    async fn run_operations(&self, ops: Vec<Operation>) -> Result<TaskRef> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.run_with_id(&task_id, ops).await?;
        Ok(TaskRef::new(task_id))
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus> { task::task_status(&self.deps, task_id).await }

    async fn get_manifest(&self, account: &str, location: &str, name: &str) -> Result<ManifestView> {
        task::get_manifest(&self.deps, account, location, name).await
    }

    async fn list_server_groups(&self, app: &str) -> Result<Vec<ServerGroup>> { server_groups::list_server_groups(&self.deps, app).await }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ref_shape() {
        let r = TaskRef::new("abc".into());
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, serde_json::json!({ "id": "abc", "resourceUri": "/task/abc" }));
    }
}
