//! Task replay and single-manifest reads.
//!
//! Task history comes only from the resource records; the live cluster is
//! consulted for current state and rollout status.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use kato_core::{ManifestName, TaskType};
use kato_kubehub::ResourceClient;
use kato_status::RolloutStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::Collaborators;

/// Current state of one object recorded by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub account: String,
    pub manifest_name: String,
    pub namespace: String,
    pub task_type: TaskType,
    /// The object is gone and the task deleted it.
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RolloutStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Json>,
}

impl ResourceStatus {
    fn is_stable(&self) -> bool { self.deleted || self.status.as_ref().map(|s| s.stable.state).unwrap_or(true) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: String,
    pub resources: Vec<ResourceStatus>,
    /// Every recorded object is stable (or deleted).
    pub stable: bool,
}

/// Replay the records of `task_id`. Not-found is tolerated for delete tasks,
/// where it confirms the delete; any other failure aborts the replay.
pub async fn task_status(deps: &Collaborators, task_id: &str) -> Result<TaskStatus> {
    let records = deps.records.list_resources_by_task_id(task_id).await?;
    let mut clients: HashMap<String, Arc<dyn ResourceClient>> = HashMap::new();
    let mut resources = Vec::with_capacity(records.len());

    for r in &records {
        let client = match clients.get(&r.account_name) {
            Some(c) => c.clone(),
            None => {
                let c = deps.connect(&r.account_name).await?;
                clients.insert(r.account_name.clone(), c.clone());
                c
            }
        };
        let mut entry = ResourceStatus {
            account: r.account_name.clone(),
            manifest_name: r.manifest_name(),
            namespace: r.namespace.clone(),
            task_type: r.task_type,
            deleted: false,
            status: None,
            manifest: None,
        };
        match client.get(&r.kind, &r.name, &r.namespace).await {
            Ok(live) => {
                entry.status = Some(kato_status::status_for(&live).with_context(|| format!("computing status of {}", entry.manifest_name))?);
                entry.manifest = Some(live);
            }
            Err(e) if r.task_type == TaskType::Delete && e.is_not_found() => {
                debug!(task_id, manifest = %entry.manifest_name, "deleted object is gone");
                entry.deleted = true;
            }
            Err(e) => return Err(e).with_context(|| format!("reading {} in account {}", entry.manifest_name, r.account_name)),
        }
        resources.push(entry);
    }

    let stable = resources.iter().all(ResourceStatus::is_stable);
    info!(task_id, resources = resources.len(), stable, "task status");
    Ok(TaskStatus { id: task_id.to_string(), resources, stable })
}

/// Live document and rollout status of one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestView {
    pub account: String,
    pub location: String,
    pub name: String,
    pub kind: String,
    pub manifest: Json,
    pub status: RolloutStatus,
}

/// `name` is `"<kind> <name>"`.
pub async fn get_manifest(deps: &Collaborators, account: &str, location: &str, name: &str) -> Result<ManifestView> {
    let manifest_name = ManifestName::parse(name)?;
    let client = deps.connect(account).await?;
    let live = client.get(&manifest_name.kind, &manifest_name.name, location).await?;
    let status = kato_status::status_for(&live)?;
    Ok(ManifestView {
        account: account.to_string(),
        location: location.to_string(),
        name: manifest_name.name,
        kind: kato_core::doc::kind(&live).to_string(),
        manifest: live,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deleted_entries_count_as_stable() {
        let mut s = ResourceStatus {
            account: "a".into(),
            manifest_name: "Deployment web".into(),
            namespace: "prod".into(),
            task_type: TaskType::Delete,
            deleted: true,
            status: None,
            manifest: None,
        };
        assert!(s.is_stable());
        s.deleted = false;
        let mut rollout = RolloutStatus::default();
        rollout.unstable("Waiting for all replicas to be updated");
        s.status = Some(rollout);
        assert!(!s.is_stable());

        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["taskType"], json!("delete"));
        assert!(v.get("manifest").is_none());
    }
}
