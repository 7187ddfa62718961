//! Server groups of an application across every account that holds its
//! resources.
//!
//! One worker per account resolves credentials, connects and lists. Workers
//! send their whole result as a single message into a channel sized to the
//! number of accounts, so a send never waits on the collector. A failing
//! account or kind contributes nothing; it never fails the aggregate.

use anyhow::Result;
use futures::future::join_all;
use kato_core::{doc, keys};
use kato_kubehub::ListOptions;
use kato_status::RolloutStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Collaborators;

const SERVER_GROUP_KINDS: &[&str] = &["replicaset", "statefulset", "daemonset"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroup {
    pub account: String,
    pub name: String,
    pub kind: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    pub created_at: String,
    pub manifest_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RolloutStatus>,
}

impl ServerGroup {
    fn from_live(account: &str, live: &Json) -> Self {
        let kind = doc::kind(live).to_string();
        let name = doc::name(live).to_string();
        let status = match kato_status::status_for(live) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(account, kind = %kind, name = %name, error = %e, "rollout status unavailable");
                None
            }
        };
        Self {
            account: account.to_string(),
            manifest_name: format!("{} {}", kind, name),
            namespace: doc::namespace(live).to_string(),
            cluster: doc::annotation(live, keys::MONIKER_CLUSTER).map(str::to_string),
            created_at: doc::creation_timestamp(live).to_string(),
            kind,
            name,
            status,
        }
    }
}

pub async fn list_server_groups(deps: &Collaborators, app: &str) -> Result<Vec<ServerGroup>> {
    let accounts = deps.accounts.list_accounts_by_application(app).await?;
    let (tx, mut rx) = mpsc::channel::<Vec<ServerGroup>>(accounts.len().max(1));

    let workers: Vec<_> = accounts
        .iter()
        .map(|account| {
            let deps = deps.clone();
            let account = account.clone();
            let app = app.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let groups = account_server_groups(&deps, &account, &app).await;
                if tx.send(groups).await.is_err() {
                    warn!(account = %account, "server group collector went away");
                }
            })
        })
        .collect();
    drop(tx);

    for joined in join_all(workers).await {
        if let Err(e) = joined {
            warn!(error = %e, "server group worker aborted");
        }
    }

    let mut out = Vec::new();
    while let Some(batch) = rx.recv().await {
        out.extend(batch);
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    info!(app, accounts = accounts.len(), server_groups = out.len(), "server groups listed");
    Ok(out)
}

async fn account_server_groups(deps: &Collaborators, account: &str, app: &str) -> Vec<ServerGroup> {
    let client = match deps.connect(account).await {
        Ok(c) => c,
        Err(e) => {
            warn!(account, error = %e, "skipping account");
            return Vec::new();
        }
    };
    let opts = ListOptions::default().labels(&keys::app_selector(app));
    let mut groups = Vec::new();
    for kind in SERVER_GROUP_KINDS {
        match client.list(kind, &opts).await {
            Ok(items) => {
                debug!(account, kind, count = items.len(), "listed");
                groups.extend(items.iter().map(|live| ServerGroup::from_live(account, live)));
            }
            Err(e) => warn!(account, kind, error = %e, "skipping kind"),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kato_core::{tokens::StaticTokenIssuer, Provider, ResourceRecord, ResourceStore, TaskType};
    use kato_kubehub::{MemoryClient, MemoryConnector};
    use kato_persist::SqliteStore;
    use serde_json::json;

    fn replica_set(name: &str, app: &str) -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "metadata": {
                "name": name,
                "namespace": "prod",
                "labels": { "app.kubernetes.io/managed-by": "spinnaker", "app.kubernetes.io/name": app },
                "annotations": { "moniker.spinnaker.io/cluster": "replicaSet web" }
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "spec": { "containers": [] } }
            },
            "status": { "replicas": 1, "readyReplicas": 1, "availableReplicas": 1, "fullyLabeledReplicas": 1 }
        })
    }

    fn deps_with(store: Arc<SqliteStore>, connector: MemoryConnector) -> Collaborators {
        Collaborators {
            accounts: store.clone(),
            records: store,
            tokens: Arc::new(StaticTokenIssuer::new("t")),
            connector: Arc::new(connector),
        }
    }

    #[tokio::test]
    async fn unreachable_accounts_are_skipped() {
        let store = Arc::new(SqliteStore::open(":memory:").unwrap());
        for (account, host) in [("a1", "https://a1"), ("a2", "https://a2"), ("a3", "https://a3")] {
            store.put_provider(&Provider { name: account.into(), host: host.into(), ..Default::default() }).unwrap();
            let id = kato_core::ResourceIdentity { name: "web-v000".into(), namespace: "prod".into(), kind: "ReplicaSet".into(), ..Default::default() };
            store.create_resource_record(&ResourceRecord::new("t", TaskType::Deploy, account, "shop", &id)).await.unwrap();
        }
        let cluster = MemoryClient::new()
            .with(replica_set("web-v001", "shop"))
            .with(replica_set("api-v000", "shop"))
            .with(replica_set("blog-v000", "blog"));
        let deps = deps_with(store, MemoryConnector::new().with_cluster("https://a2", Arc::new(cluster)));

        let groups = list_server_groups(&deps, "shop").await.unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["api-v000", "web-v001"]);
        assert!(groups.iter().all(|g| g.account == "a2"));
        assert_eq!(groups[0].cluster.as_deref(), Some("replicaSet web"));
        assert_eq!(groups[0].manifest_name, "ReplicaSet api-v000");
        assert!(groups[0].status.as_ref().map(|s| s.stable.state).unwrap_or(false));
    }

    #[tokio::test]
    async fn failing_kind_keeps_the_rest() {
        let store = Arc::new(SqliteStore::open(":memory:").unwrap());
        store.put_provider(&Provider { name: "a1".into(), host: "https://a1".into(), ..Default::default() }).unwrap();
        let id = kato_core::ResourceIdentity { name: "web".into(), namespace: "prod".into(), kind: "ReplicaSet".into(), ..Default::default() };
        store.create_resource_record(&ResourceRecord::new("t", TaskType::Deploy, "a1", "shop", &id)).await.unwrap();
        let cluster = Arc::new(MemoryClient::new().with(replica_set("web-v000", "shop")));
        cluster.fail_list("statefulset");
        let deps = deps_with(store, MemoryConnector::new().with_cluster("https://a1", cluster));

        let groups = list_server_groups(&deps, "shop").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert!(list_server_groups(&deps, "nobody").await.unwrap().is_empty());
    }
}
